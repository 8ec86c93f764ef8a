use crate::model::{ActionTarget, Key, WaitCondition, FLOW_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

fn default_flow_version() -> u32 {
    FLOW_VERSION
}

/// A named, ordered sequence of declarative steps. Immutable once loaded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(default = "default_flow_version")]
    pub flow_version: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Named values available to `${name}` substitution in fill values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery: Vec<Step>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub action: StepAction,
}

impl Step {
    #[must_use]
    pub fn new(action: StepAction) -> Self {
        Self {
            name: None,
            timeout_ms: None,
            action,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Display name: explicit name, else the step tag.
    #[must_use]
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.action.tag().to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StepAction {
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
    Disconnect,
    Wait(WaitCondition),
    Fill {
        target: ActionTarget,
        value: String,
    },
    Press {
        key: Key,
    },
    Assert(Predicate),
    SaveGolden {
        golden: String,
    },
    /// Keyboard-lock recovery on the current session.
    Recover,
}

impl StepAction {
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect => "disconnect",
            Self::Wait(_) => "wait",
            Self::Fill { .. } => "fill",
            Self::Press { .. } => "press",
            Self::Assert(_) => "assert",
            Self::SaveGolden { .. } => "save_golden",
            Self::Recover => "recover",
        }
    }
}

/// Checks an `assert` step evaluates against the current screen.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "predicate")]
pub enum Predicate {
    TextPresent {
        text: String,
    },
    TextAbsent {
        text: String,
    },
    /// Text on the configured message row.
    MessageContains {
        text: String,
    },
    CursorAt {
        row: u16,
        col: u16,
    },
    FieldEquals {
        label: String,
        #[serde(default)]
        offset: usize,
        value: String,
    },
    /// Screen layout matches a stored golden entry.
    Golden {
        name: String,
    },
    KeyboardUnlocked,
    /// Regular expression searched in the full screen text, rows joined by `\n`.
    Matches {
        pattern: String,
    },
    All {
        predicates: Vec<Predicate>,
    },
    Any {
        predicates: Vec<Predicate>,
    },
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TextPresent { text } => write!(f, "text_present '{text}'"),
            Self::TextAbsent { text } => write!(f, "text_absent '{text}'"),
            Self::MessageContains { text } => write!(f, "message_contains '{text}'"),
            Self::CursorAt { row, col } => write!(f, "cursor_at ({row},{col})"),
            Self::FieldEquals {
                label,
                offset,
                value,
            } => write!(f, "field_equals '{label}'+{offset} == '{value}'"),
            Self::Golden { name } => write!(f, "golden '{name}'"),
            Self::KeyboardUnlocked => f.write_str("keyboard_unlocked"),
            Self::Matches { pattern } => write!(f, "matches /{pattern}/"),
            Self::All { predicates } => write_group(f, "all", predicates),
            Self::Any { predicates } => write_group(f, "any", predicates),
        }
    }
}

fn write_group(f: &mut fmt::Formatter<'_>, name: &str, predicates: &[Predicate]) -> fmt::Result {
    write!(f, "{name}(")?;
    for (index, predicate) in predicates.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{predicate}")?;
    }
    f.write_str(")")
}

/// Credential values handed in by the calling layer, never read from the environment here.
#[derive(Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub secret: Option<String>,
}

impl Credentials {
    #[must_use]
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            secret: Some(secret.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .finish()
    }
}
