use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

/// Cursor position, 0-based.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub row: u16,
    pub col: u16,
}

/// 3270 extended colour.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Neutral,
    Blue,
    Red,
    Pink,
    Green,
    Turquoise,
    Yellow,
    White,
    Black,
    DeepBlue,
}

impl Color {
    /// Map an extended attribute value (`f0`..`f9`).
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        let color = match code {
            0xf0 => Self::Neutral,
            0xf1 => Self::Blue,
            0xf2 => Self::Red,
            0xf3 => Self::Pink,
            0xf4 => Self::Green,
            0xf5 => Self::Turquoise,
            0xf6 => Self::Yellow,
            0xf7 => Self::White,
            0xf8 => Self::Black,
            0xf9 => Self::DeepBlue,
            _ => return None,
        };
        Some(color)
    }
}

/// 3270 extended highlighting.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Highlight {
    Default,
    Blink,
    Reverse,
    Underscore,
}

impl Highlight {
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 | 0xf0 => Some(Self::Default),
            0xf1 => Some(Self::Blink),
            0xf2 => Some(Self::Reverse),
            0xf4 => Some(Self::Underscore),
            _ => None,
        }
    }
}

/// Display properties of a field. Never part of the layout signature.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct DisplayAttribute {
    #[serde(default)]
    pub intensified: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub numeric: bool,
    #[serde(default)]
    pub detectable: bool,
    #[serde(default)]
    pub modified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight: Option<Highlight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<Color>,
}

/// A contiguous span of cells sharing one attribute.
///
/// `col` is the first content cell (the attribute byte itself sits one cell to
/// the left) and `length` counts content cells only.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub row: u16,
    pub col: u16,
    pub length: u16,
    pub protected: bool,
    #[serde(default)]
    pub display: DisplayAttribute,
    #[serde(default)]
    pub content: String,
}

impl Field {
    #[must_use]
    pub fn new(row: u16, col: u16, length: u16, protected: bool, content: impl Into<String>) -> Self {
        Self {
            row,
            col,
            length,
            protected,
            display: DisplayAttribute::default(),
            content: content.into(),
        }
    }

    /// Exclusive end column.
    #[must_use]
    pub fn end_col(&self) -> u16 {
        self.col.saturating_add(self.length)
    }

    #[must_use]
    pub fn covers(&self, row: u16, col: u16) -> bool {
        self.row == row && col >= self.col && col < self.end_col()
    }

    /// Content with surrounding blanks removed.
    #[must_use]
    pub fn text(&self) -> &str {
        self.content.trim()
    }
}

/// One decoded terminal buffer capture. Immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Screen {
    rows: u16,
    cols: u16,
    lines: Vec<String>,
    fields: Vec<Field>,
    cursor: Cursor,
    keyboard_locked: bool,
    formatted: bool,
    #[serde(skip, default = "Instant::now")]
    captured_at: Instant,
}

impl Screen {
    /// Assemble a screen from already decoded parts.
    #[must_use]
    pub fn new(
        rows: u16,
        cols: u16,
        lines: Vec<String>,
        fields: Vec<Field>,
        cursor: Cursor,
        keyboard_locked: bool,
    ) -> Self {
        let formatted = !fields.is_empty();
        Self {
            rows,
            cols,
            lines,
            fields,
            cursor,
            keyboard_locked,
            formatted,
            captured_at: Instant::now(),
        }
    }

    /// Build a screen from fields alone, rendering their content onto a blank grid.
    #[must_use]
    pub fn from_fields(
        rows: u16,
        cols: u16,
        fields: Vec<Field>,
        cursor: Cursor,
        keyboard_locked: bool,
    ) -> Self {
        let width = usize::from(cols);
        let mut grid: Vec<Vec<char>> = (0..rows).map(|_| vec![' '; width]).collect();
        for field in &fields {
            if let Some(line) = grid.get_mut(usize::from(field.row)) {
                let start = usize::from(field.col);
                for (offset, ch) in field.content.chars().enumerate() {
                    if let Some(cell) = line.get_mut(start + offset) {
                        *cell = ch;
                    }
                }
            }
        }
        let lines = grid.into_iter().map(|row| row.into_iter().collect()).collect();
        Self::new(rows, cols, lines, fields, cursor, keyboard_locked)
    }

    #[must_use]
    pub fn rows(&self) -> u16 {
        self.rows
    }

    #[must_use]
    pub fn cols(&self) -> u16 {
        self.cols
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    #[must_use]
    pub fn keyboard_locked(&self) -> bool {
        self.keyboard_locked
    }

    /// False when the host sent no field attributes at all.
    #[must_use]
    pub fn formatted(&self) -> bool {
        self.formatted
    }

    #[must_use]
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    #[must_use]
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }

    /// Text of a fixed row, typically the host message line.
    #[must_use]
    pub fn message_line(&self, row: u16) -> Option<&str> {
        self.lines.get(usize::from(row)).map(String::as_str)
    }

    /// Full screen text, one line per row.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        !needle.is_empty() && self.lines.iter().any(|line| line.contains(needle))
    }

    /// Field whose content cells cover the position.
    #[must_use]
    pub fn field_at(&self, row: u16, col: u16) -> Option<&Field> {
        self.fields.iter().find(|field| field.covers(row, col))
    }

    /// Index of the field labelled `label`.
    ///
    /// An exact match on trimmed content wins over a substring match; among
    /// equals the first in screen order wins.
    #[must_use]
    pub fn find_label(&self, label: &str) -> Option<usize> {
        let wanted = label.trim();
        if wanted.is_empty() {
            return None;
        }
        self.fields
            .iter()
            .position(|field| field.text() == wanted)
            .or_else(|| {
                self.fields
                    .iter()
                    .position(|field| field.content.contains(wanted))
            })
    }

    /// Resolve an input field relative to the field at `index`.
    ///
    /// Offset 0 is the field itself when it is unprotected, otherwise the nearest
    /// following unprotected field. Offset `n` is the `n`th following unprotected field.
    #[must_use]
    pub fn input_field_after(&self, index: usize, offset: usize) -> Option<&Field> {
        let anchor = self.fields.get(index)?;
        if offset == 0 && !anchor.protected {
            return Some(anchor);
        }
        let skip = offset.saturating_sub(1);
        self.fields
            .iter()
            .skip(index + 1)
            .filter(|field| !field.protected)
            .nth(skip)
    }

    /// SHA-256 of the whitespace-normalized screen text.
    #[must_use]
    pub fn content_digest(&self) -> String {
        let normalized = self
            .lines
            .iter()
            .flat_map(|line| line.split_whitespace())
            .collect::<Vec<_>>()
            .join(" ");
        hex_digest(normalized.as_bytes())
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let hash = Sha256::digest(bytes);
    hash.iter().fold(String::with_capacity(64), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logon_screen() -> Screen {
        Screen::from_fields(
            24,
            80,
            vec![
                Field::new(0, 0, 8, true, "Logon ===>"),
                Field::new(0, 10, 8, false, ""),
                Field::new(1, 0, 10, true, "Password"),
                Field::new(1, 11, 8, false, ""),
            ],
            Cursor { row: 0, col: 10 },
            false,
        )
    }

    #[test]
    fn label_lookup_prefers_exact_match() {
        let screen = Screen::from_fields(
            24,
            80,
            vec![
                Field::new(0, 0, 20, true, "Userid or Logon"),
                Field::new(1, 0, 10, true, " Logon "),
            ],
            Cursor::default(),
            false,
        );
        assert_eq!(screen.find_label("Logon"), Some(1));
        assert_eq!(screen.find_label("Userid"), Some(0));
        assert_eq!(screen.find_label("   "), None);
    }

    #[test]
    fn offset_resolution_skips_protected_fields() {
        let screen = logon_screen();
        assert_eq!(screen.input_field_after(0, 0).map(|f| f.col), Some(10));
        assert_eq!(screen.input_field_after(0, 1).map(|f| f.col), Some(10));
        assert_eq!(screen.input_field_after(0, 2).map(|f| (f.row, f.col)), Some((1, 11)));
        assert!(screen.input_field_after(0, 3).is_none());
        assert_eq!(screen.input_field_after(1, 0).map(|f| f.col), Some(10));
    }

    #[test]
    fn digest_ignores_whitespace_layout() {
        let a = Screen::new(1, 10, vec!["A  B".into()], vec![], Cursor::default(), false);
        let b = Screen::new(1, 10, vec![" A B  ".into()], vec![], Cursor::default(), false);
        assert_eq!(a.content_digest(), b.content_digest());
        assert_eq!(a.content_digest().len(), 64);
    }

    #[test]
    fn message_line_is_a_fixed_row() {
        let screen = logon_screen();
        assert!(screen.message_line(0).is_some_and(|l| l.starts_with("Logon ===>")));
        assert!(screen.message_line(40).is_none());
    }
}
