//! Bridge configuration.
//!
//! A [`BridgeConfig`] is a plain serde document, loadable from JSON or YAML, with
//! a default for every field. [`BridgeConfigBuilder`] offers the same knobs in code.

use crate::decoder::Encoding;
use crate::error::{BridgeError, BridgeResult};
use crate::model::{ActionKind, Key};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_VERSION: u32 = 1;

/// Default redaction marker written in place of secrets.
pub const REDACTION_MARKER: &str = "***REDACTED***";

/// Longest sensitive-name pattern accepted.
const MAX_PATTERN_LEN: usize = 1000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub config_version: u32,
    pub emulator: EmulatorConfig,
    /// Host prefixes `connect` may target.
    pub allowed_hosts: Vec<String>,
    pub default_host: String,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub recovery: RecoveryPolicy,
    /// Action kinds the executor will dispatch.
    pub actions: Vec<ActionKind>,
    pub screen: ScreenConfig,
    pub redaction: RedactionConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goldens_dir: Option<PathBuf>,
    /// Bind address of the HTTP control surface. Loopback only.
    pub listen: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            emulator: EmulatorConfig::default(),
            allowed_hosts: vec!["127.0.0.1:".to_string(), "localhost:".to_string()],
            default_host: "127.0.0.1:3270".to_string(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            recovery: RecoveryPolicy::default(),
            actions: ActionKind::ALL.to_vec(),
            screen: ScreenConfig::default(),
            redaction: RedactionConfig::default(),
            goldens_dir: None,
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub program: String,
    /// Full argument list; when absent it is derived from `model` and `trace_file`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_file: Option<PathBuf>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            program: "s3270".to_string(),
            args: None,
            model: "3278-2".to_string(),
            trace_file: None,
        }
    }
}

impl EmulatorConfig {
    #[must_use]
    pub fn command_args(&self) -> Vec<String> {
        if let Some(args) = &self.args {
            return args.clone();
        }
        let mut args = vec![
            "-script".to_string(),
            "-model".to_string(),
            self.model.clone(),
        ];
        if let Some(trace) = &self.trace_file {
            args.push("-trace".to_string());
            args.push("-tracefile".to_string());
            args.push(trace.display().to_string());
        }
        args
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub connect_ms: u64,
    pub action_ms: u64,
    pub capture_ms: u64,
    pub disconnect_grace_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: 30_000,
            action_ms: 10_000,
            capture_ms: 5_000,
            disconnect_grace_ms: 2_000,
        }
    }
}

impl Timeouts {
    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    #[must_use]
    pub fn action(&self) -> Duration {
        Duration::from_millis(self.action_ms)
    }

    #[must_use]
    pub fn capture(&self) -> Duration {
        Duration::from_millis(self.capture_ms)
    }

    #[must_use]
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

/// Connect retry schedule: `base`, `2*base`, `4*base`, ...
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1_u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Sum of every backoff in the schedule.
    #[must_use]
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_attempts).map(|a| self.delay_after(a)).sum()
    }
}

/// Keyboard-lock recovery ladder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Keys tried in order, least destructive first.
    pub keys: Vec<Key>,
    pub max_attempts: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            keys: vec![Key::Reset, Key::Clear, Key::Pf(3)],
            max_attempts: 3,
        }
    }
}

impl RecoveryPolicy {
    /// Key for a 0-based attempt; the ladder's last key repeats if it is shorter than `max_attempts`.
    #[must_use]
    pub fn key_for_attempt(&self, attempt: usize) -> Option<Key> {
        self.keys
            .get(attempt)
            .or_else(|| self.keys.last())
            .copied()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    /// Row treated as the host message line; `None` means the last row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_row: Option<u16>,
    /// Decode order for cell codes; the first printable result wins.
    pub encodings: Vec<Encoding>,
    /// Glyph for undecodable cells.
    pub placeholder: char,
    /// A cached screen older than this is re-captured before a fill is validated.
    pub max_age_ms: u64,
}

impl ScreenConfig {
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            message_row: None,
            encodings: vec![Encoding::Ascii, Encoding::Cp037],
            placeholder: '\u{FFFD}',
            max_age_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Regex over step names and fill labels whose values are secret.
    pub sensitive_pattern: String,
    pub marker: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            sensitive_pattern: "(?i)pass|pwd|secret|pin".to_string(),
            marker: REDACTION_MARKER.to_string(),
        }
    }
}

impl RedactionConfig {
    pub fn compile(&self) -> BridgeResult<Regex> {
        if self.sensitive_pattern.len() > MAX_PATTERN_LEN {
            return Err(BridgeError::validation(
                "sensitive pattern too long",
                serde_json::json!({"max_len": MAX_PATTERN_LEN}),
            ));
        }
        Regex::new(&self.sensitive_pattern).map_err(|err| {
            BridgeError::validation(
                "invalid sensitive pattern",
                serde_json::json!({"pattern": self.sensitive_pattern, "source": err.to_string()}),
            )
        })
    }
}

impl BridgeConfig {
    /// Check every invariant the rest of the bridge relies on.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.config_version != CONFIG_VERSION {
            return Err(BridgeError::validation(
                "unsupported config_version",
                serde_json::json!({"expected": CONFIG_VERSION, "received": self.config_version}),
            ));
        }
        if self.emulator.program.trim().is_empty() {
            return Err(BridgeError::validation("emulator.program is empty", None));
        }
        if self.retry.max_attempts == 0 {
            return Err(BridgeError::validation(
                "retry.max_attempts must be at least 1",
                None,
            ));
        }
        if self.recovery.keys.is_empty() || self.recovery.max_attempts == 0 {
            return Err(BridgeError::validation(
                "recovery needs at least one key and one attempt",
                serde_json::json!({"keys": self.recovery.keys, "max_attempts": self.recovery.max_attempts}),
            ));
        }
        if self.screen.encodings.is_empty() {
            return Err(BridgeError::validation("screen.encodings is empty", None));
        }
        self.redaction.compile()?;
        self.check_host(&self.default_host)?;
        if !is_loopback_listen(&self.listen) {
            return Err(BridgeError::validation(
                "listen address must be loopback",
                serde_json::json!({"listen": self.listen}),
            ));
        }
        Ok(())
    }

    /// Reject hosts outside the allowlist or carrying characters that could
    /// break out of the `Connect(...)` directive.
    pub fn check_host(&self, host: &str) -> BridgeResult<()> {
        let well_formed = !host.is_empty()
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '_' | '[' | ']'));
        let allowed = self
            .allowed_hosts
            .iter()
            .any(|prefix| host.starts_with(prefix.as_str()));
        if well_formed && allowed {
            return Ok(());
        }
        Err(BridgeError::validation(
            format!("host '{host}' is not allowed"),
            serde_json::json!({
                "host": host,
                "allowed_hosts": self.allowed_hosts,
            }),
        ))
    }

    #[must_use]
    pub fn allows_action(&self, kind: ActionKind) -> bool {
        self.actions.contains(&kind)
    }

    /// Resolve the message row against a screen height.
    #[must_use]
    pub fn message_row(&self, rows: u16) -> u16 {
        self.screen
            .message_row
            .unwrap_or_else(|| rows.saturating_sub(1))
    }
}

fn is_loopback_listen(listen: &str) -> bool {
    if let Ok(addr) = listen.parse::<SocketAddr>() {
        return addr.ip().is_loopback();
    }
    listen.starts_with("localhost:")
}

/// Load a config document; `.yaml`/`.yml` are YAML, everything else JSON.
pub fn load_config_file(path: &Path) -> BridgeResult<BridgeConfig> {
    let data = fs::read_to_string(path)
        .map_err(|err| BridgeError::io("failed to read config file", err))?;
    let name = path.to_string_lossy();
    let config: BridgeConfig = if name.ends_with(".yaml") || name.ends_with(".yml") {
        serde_yml::from_str(&data).map_err(|err| {
            BridgeError::validation(
                "failed to parse config yaml",
                serde_json::json!({"path": name, "source": err.to_string()}),
            )
        })?
    } else {
        serde_json::from_str(&data).map_err(|err| {
            BridgeError::validation(
                "failed to parse config json",
                serde_json::json!({"path": name, "source": err.to_string()}),
            )
        })?
    };
    config.validate()?;
    Ok(config)
}

/// Fluent construction of a [`BridgeConfig`].
///
/// ```
/// use tn3270_bridge::config::BridgeConfigBuilder;
///
/// let config = BridgeConfigBuilder::new()
///     .emulator_program("/usr/bin/s3270")
///     .retry(3, 500)
///     .build()
///     .unwrap();
/// assert_eq!(config.retry.base_delay_ms, 500);
/// ```
#[derive(Clone, Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn emulator_program(mut self, program: impl Into<String>) -> Self {
        self.config.emulator.program = program.into();
        self
    }

    #[must_use]
    pub fn emulator_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.emulator.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.emulator.model = model.into();
        self
    }

    #[must_use]
    pub fn allow_host(mut self, prefix: impl Into<String>) -> Self {
        self.config.allowed_hosts.push(prefix.into());
        self
    }

    #[must_use]
    pub fn default_host(mut self, host: impl Into<String>) -> Self {
        self.config.default_host = host.into();
        self
    }

    #[must_use]
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn retry(mut self, max_attempts: u32, base_delay_ms: u64) -> Self {
        self.config.retry = RetryPolicy {
            max_attempts,
            base_delay_ms,
        };
        self
    }

    #[must_use]
    pub fn recovery_keys(mut self, keys: Vec<Key>) -> Self {
        self.config.recovery.keys = keys;
        self
    }

    #[must_use]
    pub fn recovery_attempts(mut self, max_attempts: u32) -> Self {
        self.config.recovery.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn actions(mut self, actions: Vec<ActionKind>) -> Self {
        self.config.actions = actions;
        self
    }

    #[must_use]
    pub fn message_row(mut self, row: u16) -> Self {
        self.config.screen.message_row = Some(row);
        self
    }

    #[must_use]
    pub fn encodings(mut self, encodings: Vec<Encoding>) -> Self {
        self.config.screen.encodings = encodings;
        self
    }

    #[must_use]
    pub fn screen_max_age_ms(mut self, max_age_ms: u64) -> Self {
        self.config.screen.max_age_ms = max_age_ms;
        self
    }

    #[must_use]
    pub fn sensitive_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.redaction.sensitive_pattern = pattern.into();
        self
    }

    #[must_use]
    pub fn goldens_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.goldens_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn listen(mut self, listen: impl Into<String>) -> Self {
        self.config.listen = listen.into();
        self
    }

    pub fn build(self) -> BridgeResult<BridgeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
