//! Scripted fake host speaking the emulator's script protocol.
//!
//! The host walks a TSO-style logon: `Logon ===>` panel, a hidden password
//! panel, then a `READY` panel. `Clear` blanks the screen and `PF3` backs out
//! to the logon panel. Every reply is `data:` lines, a 12-field status line and
//! `ok` / `error`, like `s3270 -script`.

pub const ROWS: u16 = 24;
pub const COLS: u16 = 80;

const PROTECTED: u8 = 0x60;
const INPUT: u8 = 0x40;
const HIDDEN_INPUT: u8 = 0x4c;
const INTENSIFIED: u8 = 0xe8;
const MESSAGE_ROW: u16 = ROWS - 1;

/// Which panel the host is showing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Panel {
    Blank,
    Logon,
    Password { user: String },
    Ready { user: String },
}

/// Failure modes a test can switch on.
#[derive(Clone, Debug)]
pub struct HostBehavior {
    /// Every `Connect` is refused.
    pub unreachable: bool,
    /// Refuse this many `Connect`s before accepting.
    pub refuse_connects: u32,
    /// Keys that release a keyboard lock (`Clear`, `Reset`, `PF3`, ...).
    pub unlock_keys: Vec<String>,
    /// This many `Enter`s lock the keyboard instead of being processed.
    pub lock_on_enter: u32,
    /// Required password; any non-empty one when `None`.
    pub password: Option<String>,
}

impl Default for HostBehavior {
    fn default() -> Self {
        Self {
            unreachable: false,
            refuse_connects: 0,
            unlock_keys: vec!["Clear".to_string()],
            lock_on_enter: 0,
            password: None,
        }
    }
}

impl HostBehavior {
    /// A host whose keyboard lock nothing releases.
    #[must_use]
    pub fn stuck() -> Self {
        Self {
            unlock_keys: Vec::new(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
struct FakeField {
    row: u16,
    attr_col: u16,
    attr: u8,
    content: String,
}

impl FakeField {
    fn new(row: u16, attr_col: u16, attr: u8, content: impl Into<String>) -> Self {
        Self {
            row,
            attr_col,
            attr,
            content: content.into(),
        }
    }

    fn protected(&self) -> bool {
        self.attr & 0x20 != 0
    }

    fn start(&self) -> u16 {
        self.attr_col + 1
    }
}

/// In-process fake host. Feed it request lines with [`FakeHost::handle`].
#[derive(Debug)]
pub struct FakeHost {
    behavior: HostBehavior,
    connected: Option<String>,
    panel: Panel,
    fields: Vec<FakeField>,
    cursor: (u16, u16),
    locked: bool,
    operator_error: bool,
    output_pending: bool,
    connect_attempts: u32,
    commands: Vec<String>,
}

impl FakeHost {
    #[must_use]
    pub fn new(behavior: HostBehavior) -> Self {
        let mut host = Self {
            behavior,
            connected: None,
            panel: Panel::Blank,
            fields: Vec::new(),
            cursor: (0, 0),
            locked: false,
            operator_error: false,
            output_pending: false,
            connect_attempts: 0,
            commands: Vec::new(),
        };
        host.show(Panel::Logon, "ENTER USERID");
        host
    }

    /// Every request line received, in order.
    #[must_use]
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    #[must_use]
    pub fn panel(&self) -> &Panel {
        &self.panel
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Host-side keyboard lock, as after an `X SYSTEM` wait.
    pub fn lock_keyboard(&mut self) {
        self.locked = true;
    }

    /// Drop the host connection under the emulator.
    pub fn drop_connection(&mut self) {
        self.connected = None;
    }

    pub fn behavior_mut(&mut self) -> &mut HostBehavior {
        &mut self.behavior
    }

    /// Handle one request line and return the full reply, terminator included.
    pub fn handle(&mut self, line: &str) -> Vec<String> {
        self.commands.push(line.to_string());
        let (name, args) = split_command(line);
        match name {
            "Connect" => self.connect(args),
            "Disconnect" => {
                self.connected = None;
                self.reply(Vec::new(), true)
            }
            "Wait" => self.wait(args),
            "ReadBuffer" => {
                let rows = self.render();
                self.output_pending = false;
                self.reply(rows, true)
            }
            "MoveCursor" => self.move_cursor(args),
            "EraseEOF" => self.erase_eof(),
            "String" => self.type_text(&unquote(args)),
            "Enter" | "Clear" | "Reset" => self.key(name),
            "PF" | "PA" => self.key(&format!("{name}{}", args.trim())),
            other => self.reply(vec![format!("Unknown action: {other}")], false),
        }
    }

    fn connect(&mut self, host: &str) -> Vec<String> {
        self.connect_attempts += 1;
        if self.behavior.unreachable || self.behavior.refuse_connects > 0 {
            self.behavior.refuse_connects = self.behavior.refuse_connects.saturating_sub(1);
            return self.reply(vec![format!("Connection refused: {host}")], false);
        }
        self.connected = Some(host.trim().to_string());
        self.locked = false;
        self.show(Panel::Logon, "ENTER USERID");
        self.reply(Vec::new(), true)
    }

    fn wait(&mut self, args: &str) -> Vec<String> {
        let until = args.split(',').nth(1).map_or("", str::trim);
        let ok = match until {
            "InputField" => self.connected.is_some() && !self.locked,
            "Unlock" => !self.locked,
            "Output" => std::mem::take(&mut self.output_pending),
            _ => true,
        };
        let data = if ok {
            Vec::new()
        } else {
            vec!["Wait: Timed out".to_string()]
        };
        self.reply(data, ok)
    }

    fn move_cursor(&mut self, args: &str) -> Vec<String> {
        let mut parts = args.split(',').map(|part| part.trim().parse::<u16>());
        match (parts.next(), parts.next()) {
            (Some(Ok(row)), Some(Ok(col))) if row < ROWS && col < COLS => {
                self.cursor = (row, col);
                self.reply(Vec::new(), true)
            }
            _ => self.reply(vec!["MoveCursor: bad position".to_string()], false),
        }
    }

    fn input_at_cursor(&self) -> Option<(usize, usize, usize)> {
        let (row, col) = self.cursor;
        let lengths = self.field_lengths();
        self.fields
            .iter()
            .zip(lengths)
            .enumerate()
            .find(|(_, (field, len))| {
                field.row == row && col >= field.start() && col < field.start() + len
            })
            .filter(|(_, (field, _))| !field.protected())
            .map(|(index, (field, len))| {
                let offset = usize::from(col - field.start());
                (index, offset, usize::from(len))
            })
    }

    fn erase_eof(&mut self) -> Vec<String> {
        if self.locked {
            return self.reply(vec!["Keyboard locked".to_string()], false);
        }
        let Some((index, offset, _)) = self.input_at_cursor() else {
            self.operator_error = true;
            return self.reply(vec!["EraseEOF: protected field".to_string()], false);
        };
        let field = &mut self.fields[index];
        field.content = field.content.chars().take(offset).collect();
        self.reply(Vec::new(), true)
    }

    fn type_text(&mut self, text: &str) -> Vec<String> {
        if self.locked {
            return self.reply(vec!["Keyboard locked".to_string()], false);
        }
        let Some((index, offset, len)) = self.input_at_cursor() else {
            self.operator_error = true;
            return self.reply(vec!["String: protected field".to_string()], false);
        };
        let typed: Vec<char> = text.chars().collect();
        if offset + typed.len() > len {
            self.operator_error = true;
            return self.reply(vec!["String: field overflow".to_string()], false);
        }
        let field = &mut self.fields[index];
        let mut chars: Vec<char> = field.content.chars().collect();
        chars.resize(offset.max(chars.len()), ' ');
        for (i, ch) in typed.iter().enumerate() {
            if let Some(cell) = chars.get_mut(offset + i) {
                *cell = *ch;
            } else {
                chars.push(*ch);
            }
        }
        field.content = chars.into_iter().collect();
        let advance = u16::try_from(typed.len()).unwrap_or(0);
        self.cursor.1 = (self.cursor.1 + advance).min(COLS - 1);
        self.reply(Vec::new(), true)
    }

    fn key(&mut self, key: &str) -> Vec<String> {
        if self.locked {
            if self.behavior.unlock_keys.iter().any(|k| k == key) {
                self.locked = false;
                self.operator_error = false;
                if key == "Clear" {
                    self.show(Panel::Blank, "");
                }
                return self.reply(Vec::new(), true);
            }
            if key == "Reset" {
                return self.reply(Vec::new(), true);
            }
            return self.reply(vec!["Keyboard locked".to_string()], false);
        }
        match key {
            "Reset" => self.operator_error = false,
            "Clear" => self.show(Panel::Blank, ""),
            "Enter" if self.behavior.lock_on_enter > 0 => {
                self.behavior.lock_on_enter -= 1;
                self.locked = true;
            }
            "Enter" => self.enter(),
            "PF3" => match self.panel {
                Panel::Password { .. } | Panel::Ready { .. } => self.show(Panel::Logon, "LOGGED OFF"),
                Panel::Blank | Panel::Logon => {}
            },
            _ => {}
        }
        self.reply(Vec::new(), true)
    }

    fn input_text(&self) -> String {
        self.fields
            .iter()
            .find(|field| !field.protected())
            .map(|field| field.content.trim().to_string())
            .unwrap_or_default()
    }

    fn enter(&mut self) {
        let input = self.input_text();
        match self.panel.clone() {
            Panel::Blank => self.show(Panel::Logon, "ENTER USERID"),
            Panel::Logon if input.is_empty() => self.show(Panel::Logon, "USERID REQUIRED"),
            Panel::Logon => self.show(Panel::Password { user: input }, "ENTER PASSWORD"),
            Panel::Password { user } => {
                let accepted = !input.is_empty()
                    && self.behavior.password.iter().all(|expected| *expected == input);
                if accepted {
                    self.show(Panel::Ready { user }, "LOGON SUCCESSFUL");
                } else {
                    self.show(Panel::Password { user }, "PASSWORD INCORRECT");
                }
            }
            Panel::Ready { user } => self.show(Panel::Ready { user }, "READY"),
        }
    }

    fn show(&mut self, panel: Panel, message: &str) {
        self.fields = match &panel {
            Panel::Blank => Vec::new(),
            Panel::Logon => vec![
                FakeField::new(0, 0, PROTECTED, "Logon ===>"),
                FakeField::new(0, 11, INPUT, ""),
                FakeField::new(0, 20, PROTECTED, ""),
                FakeField::new(MESSAGE_ROW, 0, INTENSIFIED, message),
            ],
            Panel::Password { user } => vec![
                FakeField::new(0, 0, PROTECTED, "Password ===>"),
                FakeField::new(0, 14, HIDDEN_INPUT, ""),
                FakeField::new(0, 23, PROTECTED, ""),
                FakeField::new(1, 0, PROTECTED, format!("Userid: {user}")),
                FakeField::new(MESSAGE_ROW, 0, INTENSIFIED, message),
            ],
            Panel::Ready { user } => vec![
                FakeField::new(0, 0, PROTECTED, format!("READY {user}")),
                FakeField::new(1, 0, INPUT, ""),
                FakeField::new(MESSAGE_ROW, 0, INTENSIFIED, message),
            ],
        };
        self.cursor = self
            .fields
            .iter()
            .find(|field| !field.protected())
            .map_or((0, 0), |field| (field.row, field.start()));
        self.panel = panel;
        self.output_pending = true;
    }

    /// Content length of each field: up to the next attribute on its row.
    fn field_lengths(&self) -> Vec<u16> {
        self.fields
            .iter()
            .map(|field| {
                let next = self
                    .fields
                    .iter()
                    .filter(|other| other.row == field.row && other.attr_col > field.attr_col)
                    .map(|other| other.attr_col)
                    .min()
                    .unwrap_or(COLS);
                next - field.start()
            })
            .collect()
    }

    fn render(&self) -> Vec<String> {
        let mut grid = vec![vec!["00".to_string(); usize::from(COLS)]; usize::from(ROWS)];
        for (field, len) in self.fields.iter().zip(self.field_lengths()) {
            let row = &mut grid[usize::from(field.row)];
            row[usize::from(field.attr_col)] = format!("SF(c0={:02x})", field.attr);
            for (offset, ch) in field.content.chars().take(usize::from(len)).enumerate() {
                row[usize::from(field.start()) + offset] = format!("{:02x}", u32::from(ch) & 0xff);
            }
        }
        grid.into_iter().map(|cells| cells.join(" ")).collect()
    }

    fn status_line(&self) -> String {
        let keyboard = if self.locked {
            "L"
        } else if self.operator_error {
            "E"
        } else {
            "U"
        };
        let formatted = if self.fields.is_empty() { "U" } else { "F" };
        let connection = self
            .connected
            .as_ref()
            .map_or_else(|| "N".to_string(), |host| format!("C({host})"));
        format!(
            "{keyboard} {formatted} U {connection} I 2 {ROWS} {COLS} {} {} 0x0 0.000",
            self.cursor.0, self.cursor.1
        )
    }

    fn reply(&self, data: Vec<String>, ok: bool) -> Vec<String> {
        let mut lines: Vec<String> = data.into_iter().map(|line| format!("data: {line}")).collect();
        lines.push(self.status_line());
        lines.push(if ok { "ok" } else { "error" }.to_string());
        lines
    }
}

fn split_command(line: &str) -> (&str, &str) {
    let line = line.trim();
    match line.split_once('(') {
        Some((name, rest)) => (name.trim(), rest.strip_suffix(')').unwrap_or(rest)),
        None => (line, ""),
    }
}

fn unquote(args: &str) -> String {
    let inner = args
        .trim()
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(args);
    let mut out = String::new();
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn ok(reply: &[String]) -> bool {
        reply.last().map(String::as_str) == Some("ok")
    }

    #[test]
    fn logon_walkthrough() {
        let mut host = FakeHost::new(HostBehavior::default());
        assert!(ok(&host.handle("Connect(127.0.0.1:3270)")));
        assert!(ok(&host.handle("Wait(5,InputField)")));
        assert!(ok(&host.handle("MoveCursor(0,12)")));
        assert!(ok(&host.handle("EraseEOF()")));
        assert!(ok(&host.handle(r#"String("HERC02")"#)));
        assert!(ok(&host.handle("Enter()")));
        assert_eq!(
            host.panel(),
            &Panel::Password {
                user: "HERC02".to_string()
            }
        );
    }

    #[test]
    fn renders_field_attributes() {
        let mut host = FakeHost::new(HostBehavior::default());
        host.handle("Connect(127.0.0.1:3270)");
        let reply = host.handle("ReadBuffer(Ascii)");
        assert_eq!(reply.len(), usize::from(ROWS) + 2);
        assert!(reply[0].starts_with("data: SF(c0=60) 4c 6f 67 6f 6e"));
        assert!(reply[usize::from(ROWS)].starts_with("U F U C(127.0.0.1:3270)"));
    }

    #[test]
    fn locked_keyboard_rejects_input_until_unlocked() {
        let mut host = FakeHost::new(HostBehavior::default());
        host.handle("Connect(127.0.0.1:3270)");
        host.lock_keyboard();
        assert!(!ok(&host.handle("Enter()")));
        assert!(ok(&host.handle("Reset()")));
        assert!(host.is_locked());
        assert!(ok(&host.handle("Clear()")));
        assert!(!host.is_locked());
        assert_eq!(host.panel(), &Panel::Blank);
    }

    #[test]
    fn refusals_are_counted() {
        let mut host = FakeHost::new(HostBehavior::unreachable());
        let reply = host.handle("Connect(10.0.0.1:3270)");
        assert!(!ok(&reply));
        assert!(reply[0].contains("refused"));
        assert_eq!(host.connect_attempts(), 1);
    }
}
