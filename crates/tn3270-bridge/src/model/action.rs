use crate::error::{BridgeError, BridgeResult};
use crate::model::Screen;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Keys accepted by `press`, as shown in validation errors.
pub const SUPPORTED_KEYS: &[&str] = &["Enter", "Clear", "Reset", "PF1-PF24", "PA1-PA3"];

/// Highest programmed function key.
pub const MAX_PF: u8 = 24;
/// Highest programmed attention key.
pub const MAX_PA: u8 = 3;

/// Closed set of keys the bridge will ever send.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Key {
    Enter,
    Clear,
    /// Keyboard soft reset. Not an AID; unlocks without transmitting.
    Reset,
    Pf(u8),
    Pa(u8),
}

impl Key {
    /// Parse a key name case-insensitively (`"enter"`, `"PF3"`, `"pf03"`).
    pub fn parse(name: &str) -> BridgeResult<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let key = match upper.as_str() {
            "ENTER" => Some(Self::Enter),
            "CLEAR" => Some(Self::Clear),
            "RESET" => Some(Self::Reset),
            other => parse_numbered(other, "PF", MAX_PF)
                .map(Self::Pf)
                .or_else(|| parse_numbered(other, "PA", MAX_PA).map(Self::Pa)),
        };
        key.ok_or_else(|| {
            BridgeError::validation(
                format!("unsupported key '{name}'"),
                serde_json::json!({
                    "received_key": name,
                    "supported_keys": SUPPORTED_KEYS,
                }),
            )
        })
    }

    /// True for keys that transmit an attention identifier to the host.
    #[must_use]
    pub fn is_aid(self) -> bool {
        !matches!(self, Self::Reset)
    }
}

fn parse_numbered(name: &str, prefix: &str, max: u8) -> Option<u8> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || digits.len() > 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number: u8 = digits.parse().ok()?;
    (1..=max).contains(&number).then_some(number)
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enter => f.write_str("Enter"),
            Self::Clear => f.write_str("Clear"),
            Self::Reset => f.write_str("Reset"),
            Self::Pf(n) => write!(f, "PF{n}"),
            Self::Pa(n) => write!(f, "PA{n}"),
        }
    }
}

impl FromStr for Key {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Key {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.to_string()
    }
}

/// Allowlisted action kinds. Nothing outside this set reaches a session.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Connect,
    Disconnect,
    ReadScreen,
    Fill,
    FillByLabel,
    Press,
    Wait,
    Recover,
}

impl ActionKind {
    pub const ALL: &'static [ActionKind] = &[
        Self::Connect,
        Self::Disconnect,
        Self::ReadScreen,
        Self::Fill,
        Self::FillByLabel,
        Self::Press,
        Self::Wait,
        Self::Recover,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::ReadScreen => "read_screen",
            Self::Fill => "fill",
            Self::FillByLabel => "fill_by_label",
            Self::Press => "press",
            Self::Wait => "wait",
            Self::Recover => "recover",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a fill lands.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionTarget {
    Position {
        row: u16,
        col: u16,
    },
    Label {
        label: String,
        #[serde(default)]
        offset: usize,
    },
}

impl fmt::Display for ActionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Position { row, col } => write!(f, "({row},{col})"),
            Self::Label { label, offset } => write!(f, "'{label}'+{offset}"),
        }
    }
}

/// Conditions a wait can block on.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "condition")]
pub enum WaitCondition {
    /// Keyboard unlocked and an input field present.
    Ready,
    /// Screen content digest differs from the one before the last fill or key,
    /// or from the one seen when the wait began if no action preceded it.
    #[serde(alias = "screen-changed")]
    ScreenChanged,
    Text { text: String },
    #[serde(alias = "text-absent")]
    TextAbsent { text: String },
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::ScreenChanged => f.write_str("screen_changed"),
            Self::Text { text } => write!(f, "text '{text}'"),
            Self::TextAbsent { text } => write!(f, "text absent '{text}'"),
        }
    }
}

/// A stateless request value.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ActionTarget>,
    /// Text to type, key name, or host depending on `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ActionRequest {
    #[must_use]
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            target: None,
            payload: None,
            timeout_ms: None,
        }
    }

    #[must_use]
    pub fn with_target(mut self, target: ActionTarget) -> Self {
        self.target = Some(target);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Ok,
    Locked,
    Timeout,
    ProtocolError,
    NotFound,
}

/// Outcome of one action. Never mutated after construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_after: Option<Screen>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl ActionResult {
    #[must_use]
    pub fn ok(screen_after: Screen) -> Self {
        Self {
            status: ActionStatus::Ok,
            screen_after: Some(screen_after),
            detail: None,
            context: None,
        }
    }

    #[must_use]
    pub fn failed(status: ActionStatus, screen_after: Option<Screen>, err: &BridgeError) -> Self {
        Self {
            status,
            screen_after,
            detail: Some(err.message.clone()),
            context: err.context.clone(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ActionStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_case_insensitively() {
        assert_eq!(Key::parse("enter").ok(), Some(Key::Enter));
        assert_eq!(Key::parse("pf03").ok(), Some(Key::Pf(3)));
        assert_eq!(Key::parse("PF24").ok(), Some(Key::Pf(24)));
        assert_eq!(Key::parse("Pa2").ok(), Some(Key::Pa(2)));
    }

    #[test]
    fn rejects_keys_outside_the_set() {
        for name in ["PF0", "PF25", "PA4", "Tab", "", "PF", "PF1x", "Enter; rm"] {
            let err = Key::parse(name).err();
            assert!(err.is_some(), "{name} should be rejected");
        }
    }

    #[test]
    fn key_display_round_trips() {
        for key in [Key::Enter, Key::Clear, Key::Reset, Key::Pf(12), Key::Pa(1)] {
            assert_eq!(Key::parse(&key.to_string()).ok(), Some(key));
        }
    }

    #[test]
    fn wait_conditions_accept_hyphenated_names() {
        let parse = |value| serde_json::from_value::<WaitCondition>(value).ok();
        assert_eq!(
            parse(serde_json::json!({"condition": "screen-changed"})),
            Some(WaitCondition::ScreenChanged)
        );
        assert_eq!(
            parse(serde_json::json!({"condition": "screen_changed"})),
            Some(WaitCondition::ScreenChanged)
        );
        assert_eq!(
            parse(serde_json::json!({"condition": "text-absent", "text": "BUSY"})),
            Some(WaitCondition::TextAbsent { text: "BUSY".into() })
        );
    }
}
