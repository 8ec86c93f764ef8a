//! Buffer decoding: `ReadBuffer` rows into a [`Screen`].
//!
//! Each row of a buffer dump is a whitespace-separated list of cells. A cell is
//! either a character code in hex (`c1`) or a field attribute (`SF(c0=e0,42=f2)`).
//! Character-attribute changes (`SA(...)`) occupy no position and are skipped.
//!
//! Field geometry comes from attribute cells alone: a field starts at the cell
//! after its attribute and runs until the next attribute or the end of the row.
//! Cells at the start of a row that precede any attribute belong to a continuation
//! field carrying the attribute in force (wrapping from the end of the screen for
//! the first row). Decoding never fails; malformed cells render as the placeholder.

mod codec;

pub use codec::{decode_code, decode_ranked, Encoding};

use crate::config::ScreenConfig;
use crate::model::{Color, Cursor, DisplayAttribute, Field, Highlight, Screen};

const PROTECTED_BIT: u8 = 0x20;
const NUMERIC_BIT: u8 = 0x10;
const DISPLAY_MASK: u8 = 0x0c;
const MODIFIED_BIT: u8 = 0x01;

/// Grid facts taken from the emulator status line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub rows: u16,
    pub cols: u16,
    pub cursor: Cursor,
    pub keyboard_locked: bool,
}

/// Decoded field attribute.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FieldAttribute {
    pub protected: bool,
    pub display: DisplayAttribute,
}

impl FieldAttribute {
    /// Decode a 3270 field attribute byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        let display_bits = byte & DISPLAY_MASK;
        Self {
            protected: byte & PROTECTED_BIT != 0,
            display: DisplayAttribute {
                intensified: display_bits == 0x08,
                hidden: display_bits == DISPLAY_MASK,
                numeric: byte & NUMERIC_BIT != 0,
                detectable: display_bits == 0x04 || display_bits == 0x08,
                modified: byte & MODIFIED_BIT != 0,
                ..DisplayAttribute::default()
            },
        }
    }

    /// Parse the inside of `SF(...)`: `c0=XX` plus extended `41`/`42`/`45` pairs.
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        let mut attr = Self::default();
        let mut extended = Vec::new();
        for pair in spec.split(',') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let Ok(value) = u8::from_str_radix(value.trim(), 16) else {
                continue;
            };
            match key.trim() {
                "c0" => attr = Self::from_byte(value),
                other => extended.push((other.to_string(), value)),
            }
        }
        for (key, value) in extended {
            match key.as_str() {
                "41" => attr.display.highlight = Highlight::from_code(value),
                "42" => attr.display.foreground = Color::from_code(value),
                "45" => attr.display.background = Color::from_code(value),
                _ => {}
            }
        }
        attr
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Cell {
    Char(char),
    Attribute(FieldAttribute),
}

/// Stateless decoder configured with an encoding fallback chain.
#[derive(Clone, Debug)]
pub struct ScreenDecoder {
    encodings: Vec<Encoding>,
    placeholder: char,
}

impl Default for ScreenDecoder {
    fn default() -> Self {
        Self::new(&ScreenConfig::default())
    }
}

impl ScreenDecoder {
    #[must_use]
    pub fn new(config: &ScreenConfig) -> Self {
        Self {
            encodings: config.encodings.clone(),
            placeholder: config.placeholder,
        }
    }

    /// Decode buffer rows (payloads without the `data:` prefix).
    ///
    /// Missing rows or cells are blank; surplus ones are ignored.
    #[must_use]
    pub fn decode(&self, buffer: &[String], geometry: Geometry) -> Screen {
        let (screen, stats) = self.decode_with_stats(buffer, geometry);
        if stats.fallback > 0 || stats.undecodable > 0 {
            tracing::warn!(
                primary = ?self.encodings.first(),
                fallback = stats.fallback,
                undecodable = stats.undecodable,
                "buffer decoded with fallback encodings"
            );
        }
        screen
    }

    /// [`Self::decode`] plus counts of cells that needed a fallback encoding or
    /// the placeholder.
    #[must_use]
    pub fn decode_with_stats(&self, buffer: &[String], geometry: Geometry) -> (Screen, DecodeStats) {
        let width = usize::from(geometry.cols);
        let mut stats = DecodeStats::default();
        let grid: Vec<Vec<Cell>> = (0..usize::from(geometry.rows))
            .map(|row| {
                let mut cells: Vec<Cell> = buffer
                    .get(row)
                    .map(|line| self.parse_row(line, &mut stats))
                    .unwrap_or_default();
                cells.resize(width, Cell::Char(' '));
                cells
            })
            .collect();

        let wrap_attr = grid.iter().flatten().rev().find_map(|cell| match cell {
            Cell::Attribute(attr) => Some(*attr),
            Cell::Char(_) => None,
        });

        let mut lines = Vec::with_capacity(grid.len());
        let mut fields = Vec::new();
        let mut carried = wrap_attr;
        for (row_index, cells) in grid.iter().enumerate() {
            let row = u16::try_from(row_index).unwrap_or(u16::MAX);
            let (line, row_fields, last_attr) = build_row(row, cells, carried);
            lines.push(line);
            fields.extend(row_fields);
            carried = last_attr;
        }

        let screen = Screen::new(
            geometry.rows,
            geometry.cols,
            lines,
            fields,
            geometry.cursor,
            geometry.keyboard_locked,
        );
        (screen, stats)
    }

    fn parse_row(&self, line: &str, stats: &mut DecodeStats) -> Vec<Cell> {
        line.split_whitespace()
            .filter(|token| !token.starts_with("SA("))
            .map(|token| self.parse_token(token, stats))
            .collect()
    }

    fn parse_token(&self, token: &str, stats: &mut DecodeStats) -> Cell {
        if let Some(spec) = token
            .strip_prefix("SF(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return Cell::Attribute(FieldAttribute::parse(spec));
        }
        if token.len() == 2 {
            if let Ok(code) = u8::from_str_radix(token, 16) {
                return match decode_ranked(code, &self.encodings) {
                    Some((rank, ch)) => {
                        if rank > 0 {
                            stats.fallback += 1;
                        }
                        Cell::Char(ch)
                    }
                    None => {
                        stats.undecodable += 1;
                        Cell::Char(self.placeholder)
                    }
                };
            }
        }
        stats.undecodable += 1;
        Cell::Char(self.placeholder)
    }
}

/// Per-capture decoding counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DecodeStats {
    /// Cells decoded by an encoding after the first.
    pub fallback: usize,
    /// Cells rendered as the placeholder.
    pub undecodable: usize,
}

struct OpenField {
    attr: FieldAttribute,
    start: usize,
    content: String,
}

impl OpenField {
    fn close(self, row: u16, end: usize) -> Field {
        let length = end.saturating_sub(self.start);
        let content = if self.attr.display.hidden {
            " ".repeat(self.content.chars().count())
        } else {
            self.content
        };
        Field {
            row,
            col: u16::try_from(self.start).unwrap_or(u16::MAX),
            length: u16::try_from(length).unwrap_or(u16::MAX),
            protected: self.attr.protected,
            display: self.attr.display,
            content,
        }
    }
}

/// Render one row and cut its fields. Returns the attribute in force at row end.
fn build_row(
    row: u16,
    cells: &[Cell],
    carried: Option<FieldAttribute>,
) -> (String, Vec<Field>, Option<FieldAttribute>) {
    let mut line = String::with_capacity(cells.len());
    let mut fields = Vec::new();
    let starts_with_attr = matches!(cells.first(), Some(Cell::Attribute(_)));
    let mut open = carried
        .filter(|_| !starts_with_attr)
        .map(|attr| OpenField {
            attr,
            start: 0,
            content: String::new(),
        });
    let mut current_attr = carried;

    for (col, cell) in cells.iter().enumerate() {
        match cell {
            Cell::Attribute(attr) => {
                if let Some(field) = open.take() {
                    fields.push(field.close(row, col));
                }
                line.push(' ');
                current_attr = Some(*attr);
                open = Some(OpenField {
                    attr: *attr,
                    start: col + 1,
                    content: String::new(),
                });
            }
            Cell::Char(ch) => {
                let hidden = open.as_ref().is_some_and(|f| f.attr.display.hidden);
                line.push(if hidden { ' ' } else { *ch });
                if let Some(field) = open.as_mut() {
                    field.content.push(*ch);
                }
            }
        }
    }
    if let Some(field) = open.take() {
        fields.push(field.close(row, cells.len()));
    }
    (line, fields, current_attr)
}
