//! The emulator's line-oriented script protocol.
//!
//! Requests are rendered only from the closed [`ScriptCommand`] enum, so no
//! caller-supplied string is ever sent verbatim. Replies are zero or more
//! `data:` lines, a 12-field status line, then `ok` or `error`.

use crate::error::{BridgeError, BridgeResult};
use crate::model::{Cursor, Key};
use std::fmt;

const STATUS_FIELDS: usize = 12;

/// What a `Wait` directive blocks on inside the emulator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitFor {
    InputField,
    Unlock,
    Output,
}

impl WaitFor {
    fn as_str(self) -> &'static str {
        match self {
            Self::InputField => "InputField",
            Self::Unlock => "Unlock",
            Self::Output => "Output",
        }
    }
}

/// Every directive the bridge can send.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScriptCommand {
    Connect { host: String },
    Disconnect,
    Wait { secs: u64, until: WaitFor },
    ReadBuffer,
    /// 0-based position.
    MoveCursor { row: u16, col: u16 },
    EraseEof,
    String { text: String },
    Key(Key),
}

impl ScriptCommand {
    /// Directive text, without the trailing newline.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Connect { host } => format!("Connect({host})"),
            Self::Disconnect => "Disconnect()".to_string(),
            Self::Wait { secs, until } => format!("Wait({secs},{})", until.as_str()),
            Self::ReadBuffer => "ReadBuffer(Ascii)".to_string(),
            Self::MoveCursor { row, col } => format!("MoveCursor({row},{col})"),
            Self::EraseEof => "EraseEOF()".to_string(),
            Self::String { text } => format!("String(\"{}\")", escape(text)),
            Self::Key(key) => match key {
                Key::Enter => "Enter()".to_string(),
                Key::Clear => "Clear()".to_string(),
                Key::Reset => "Reset()".to_string(),
                Key::Pf(n) => format!("PF({n})"),
                Key::Pa(n) => format!("PA({n})"),
            },
        }
    }

    /// Directive name only, safe to log.
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "Connect",
            Self::Disconnect => "Disconnect",
            Self::Wait { .. } => "Wait",
            Self::ReadBuffer => "ReadBuffer",
            Self::MoveCursor { .. } => "MoveCursor",
            Self::EraseEof => "EraseEOF",
            Self::String { .. } => "String",
            Self::Key(_) => "Key",
        }
    }
}

impl fmt::Display for ScriptCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Quote-safe text for a single command line. Control characters are dropped:
/// the emulator would read a newline as the end of the command.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            other if other.is_control() => {}
            other => out.push(other),
        }
    }
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyboardState {
    Unlocked,
    Locked,
    /// Operator error lock (input rejected).
    Error,
}

/// Parsed status line.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusLine {
    pub keyboard: KeyboardState,
    pub formatted: bool,
    pub field_protected: bool,
    /// `Some(host)` when connected.
    pub connection: Option<String>,
    pub mode: String,
    pub model: String,
    pub rows: u16,
    pub cols: u16,
    pub cursor: Cursor,
    pub window_id: String,
    pub exec_secs: f64,
}

impl StatusLine {
    pub fn parse(line: &str) -> BridgeResult<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [kbd, fmt_flag, prot, conn, mode, model, rows, cols, crow, ccol, window, exec] =
            parts.as_slice()
        else {
            return Err(BridgeError::protocol(
                "malformed status line",
                serde_json::json!({"line": line, "expected_fields": STATUS_FIELDS}),
            ));
        };
        let keyboard = match *kbd {
            "U" => KeyboardState::Unlocked,
            "L" => KeyboardState::Locked,
            "E" => KeyboardState::Error,
            _ => {
                return Err(BridgeError::protocol(
                    "unknown keyboard state in status line",
                    serde_json::json!({"line": line}),
                ))
            }
        };
        let connection = conn
            .strip_prefix("C(")
            .and_then(|rest| rest.strip_suffix(')'))
            .map(str::to_string);
        let number = |value: &str| {
            value.parse::<u16>().map_err(|_| {
                BridgeError::protocol(
                    "non-numeric geometry in status line",
                    serde_json::json!({"line": line, "value": value}),
                )
            })
        };
        Ok(Self {
            keyboard,
            formatted: *fmt_flag == "F",
            field_protected: *prot == "P",
            connection,
            mode: (*mode).to_string(),
            model: (*model).to_string(),
            rows: number(*rows)?,
            cols: number(*cols)?,
            cursor: Cursor {
                row: number(*crow)?,
                col: number(*ccol)?,
            },
            window_id: (*window).to_string(),
            exec_secs: exec.parse().unwrap_or(0.0),
        })
    }

    #[must_use]
    pub fn keyboard_locked(&self) -> bool {
        self.keyboard != KeyboardState::Unlocked
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// One complete reply.
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptReply {
    pub data: Vec<String>,
    pub status: StatusLine,
    pub ok: bool,
}

impl ScriptReply {
    /// Whether a raw line terminates a reply.
    #[must_use]
    pub fn is_terminator(line: &str) -> bool {
        matches!(line.trim(), "ok" | "error")
    }

    /// Parse a complete reply block (terminator included).
    pub fn parse(lines: &[String]) -> BridgeResult<Self> {
        let Some((terminator, rest)) = lines.split_last() else {
            return Err(BridgeError::protocol("empty reply", None));
        };
        let ok = match terminator.trim() {
            "ok" => true,
            "error" => false,
            other => {
                return Err(BridgeError::protocol(
                    "reply not terminated by ok/error",
                    serde_json::json!({"last_line": other}),
                ))
            }
        };
        let Some((status_line, data_lines)) = rest.split_last() else {
            return Err(BridgeError::protocol(
                "reply has no status line",
                serde_json::json!({"lines": lines}),
            ));
        };
        let status = StatusLine::parse(status_line)?;
        let data = data_lines
            .iter()
            .map(|line| {
                line.strip_prefix("data:")
                    .map(|payload| payload.strip_prefix(' ').unwrap_or(payload))
                    .map(str::to_string)
                    .ok_or_else(|| {
                        BridgeError::protocol(
                            "unexpected line in reply",
                            serde_json::json!({"line": line}),
                        )
                    })
            })
            .collect::<BridgeResult<Vec<_>>>()?;
        Ok(Self { data, status, ok })
    }

    /// Data lines joined, the emulator's explanation on `error`.
    #[must_use]
    pub fn message(&self) -> String {
        self.data.join(" ")
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    const STATUS: &str = "U F U C(127.0.0.1:3270) I 2 24 80 5 12 0x0 0.010";

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn renders_directives() {
        assert_eq!(
            ScriptCommand::Connect {
                host: "127.0.0.1:3270".into()
            }
            .render(),
            "Connect(127.0.0.1:3270)"
        );
        assert_eq!(
            ScriptCommand::Wait {
                secs: 5,
                until: WaitFor::Unlock
            }
            .render(),
            "Wait(5,Unlock)"
        );
        assert_eq!(ScriptCommand::Key(Key::Pf(3)).render(), "PF(3)");
        assert_eq!(ScriptCommand::Key(Key::Clear).render(), "Clear()");
    }

    #[test]
    fn string_payload_is_escaped() {
        let cmd = ScriptCommand::String {
            text: r#"a"b\c"#.into(),
        };
        assert_eq!(cmd.render(), r#"String("a\"b\\c")"#);
        assert_eq!(cmd.verb(), "String");
    }

    #[test]
    fn string_payload_stays_on_one_line() {
        let cmd = ScriptCommand::String {
            text: "HERC02\nClear()\r".into(),
        };
        assert_eq!(cmd.render(), r#"String("HERC02Clear()")"#);
    }

    #[test]
    fn parses_status_line() {
        let status = StatusLine::parse(STATUS).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(status.keyboard, KeyboardState::Unlocked);
        assert_eq!(status.connection.as_deref(), Some("127.0.0.1:3270"));
        assert_eq!((status.rows, status.cols), (24, 80));
        assert_eq!(status.cursor, Cursor { row: 5, col: 12 });
        assert!(status.formatted);
    }

    #[test]
    fn parses_reply_block() {
        let reply = ScriptReply::parse(&lines(&["data: 41 42", "data: 43", STATUS, "ok"]))
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(reply.ok);
        assert_eq!(reply.data, vec!["41 42".to_string(), "43".to_string()]);
    }

    #[test]
    fn rejects_malformed_replies() {
        assert!(ScriptReply::parse(&lines(&["ok"])).is_err());
        assert!(ScriptReply::parse(&lines(&[STATUS, "maybe"])).is_err());
        assert!(ScriptReply::parse(&lines(&["garbage", STATUS, "ok"])).is_err());
        assert!(StatusLine::parse("U F U").is_err());
    }
}
