//! Error taxonomy shared by every layer of the bridge.
//!
//! All failures surface as a [`BridgeError`] carrying a stable [`ErrorCode`], a
//! human-readable message and optional structured context. Nothing in the library
//! panics on a session-level fault; callers always receive a typed result.

use crate::model::ErrorInfo;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Convenience alias used throughout the crate.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Stable, machine-readable error codes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Host unreachable or the emulator could not be started.
    #[serde(rename = "E_CONNECT")]
    Connect,
    /// Keyboard is locked by the host.
    #[serde(rename = "E_LOCKED")]
    Locked,
    /// A bounded wait expired.
    #[serde(rename = "E_TIMEOUT")]
    Timeout,
    /// Malformed or unexpected emulator reply.
    #[serde(rename = "E_PROTOCOL")]
    Protocol,
    /// Label or field lookup miss.
    #[serde(rename = "E_NOT_FOUND")]
    NotFound,
    /// Disallowed action, key or argument; rejected before any I/O.
    #[serde(rename = "E_VALIDATION")]
    Validation,
    /// Session is faulted and must be reset.
    #[serde(rename = "E_SESSION_FAULTED")]
    SessionFaulted,
    /// No live session for the request.
    #[serde(rename = "E_NOT_CONNECTED")]
    NotConnected,
    /// Golden registry failure (unknown name, bad store).
    #[serde(rename = "E_GOLDEN")]
    Golden,
    /// Filesystem or pipe failure.
    #[serde(rename = "E_IO")]
    Io,
    /// A flow `assert` step did not hold.
    #[serde(rename = "E_ASSERTION")]
    Assertion,
    /// Flow run canceled by the caller.
    #[serde(rename = "E_CANCELED")]
    Canceled,
    /// Two run logs diverged.
    #[serde(rename = "E_REPLAY_MISMATCH")]
    ReplayMismatch,
    /// Invariant violated inside the bridge.
    #[serde(rename = "E_INTERNAL")]
    Internal,
}

const ALL_CODES: &[ErrorCode] = &[
    ErrorCode::Connect,
    ErrorCode::Locked,
    ErrorCode::Timeout,
    ErrorCode::Protocol,
    ErrorCode::NotFound,
    ErrorCode::Validation,
    ErrorCode::SessionFaulted,
    ErrorCode::NotConnected,
    ErrorCode::Golden,
    ErrorCode::Io,
    ErrorCode::Assertion,
    ErrorCode::Canceled,
    ErrorCode::ReplayMismatch,
    ErrorCode::Internal,
];

impl ErrorCode {
    /// Wire representation, e.g. `E_CONNECT`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "E_CONNECT",
            Self::Locked => "E_LOCKED",
            Self::Timeout => "E_TIMEOUT",
            Self::Protocol => "E_PROTOCOL",
            Self::NotFound => "E_NOT_FOUND",
            Self::Validation => "E_VALIDATION",
            Self::SessionFaulted => "E_SESSION_FAULTED",
            Self::NotConnected => "E_NOT_CONNECTED",
            Self::Golden => "E_GOLDEN",
            Self::Io => "E_IO",
            Self::Assertion => "E_ASSERTION",
            Self::Canceled => "E_CANCELED",
            Self::ReplayMismatch => "E_REPLAY_MISMATCH",
            Self::Internal => "E_INTERNAL",
        }
    }

    /// Parse a wire code back into the enum.
    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        ALL_CODES.iter().copied().find(|c| c.as_str() == code)
    }

    /// Process exit code used by the CLI.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Validation => 2,
            Self::Connect => 3,
            Self::Timeout => 4,
            Self::Locked | Self::SessionFaulted | Self::NotConnected => 5,
            Self::Protocol => 6,
            Self::NotFound | Self::Golden => 7,
            Self::ReplayMismatch => 8,
            Self::Io => 9,
            Self::Canceled => 130,
            Self::Internal => 10,
            Self::Assertion => 11,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single error type of the bridge.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BridgeError {
    /// Stable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured detail for diagnosis without re-running against the host.
    pub context: Option<Value>,
}

impl BridgeError {
    /// Build an error with an explicit code.
    pub fn new(code: ErrorCode, message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self {
            code,
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn connect(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Connect, message, context)
    }

    pub fn locked(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Locked, message, None)
    }

    pub fn timeout(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Timeout, message, context)
    }

    pub fn protocol(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Protocol, message, context)
    }

    pub fn not_found(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::NotFound, message, context)
    }

    pub fn validation(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Validation, message, context)
    }

    pub fn faulted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SessionFaulted, message, None)
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotConnected, message, None)
    }

    pub fn golden(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Golden, message, context)
    }

    pub fn assertion(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self::new(ErrorCode::Assertion, message, context)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message, None)
    }

    /// Wrap an underlying failure, keeping its rendering as `context.source`.
    pub fn io(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Io,
            message,
            serde_json::json!({ "source": err.to_string() }),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message, None)
    }

    /// Serializable projection for results, logs and HTTP bodies.
    #[must_use]
    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code,
            message: self.message.clone(),
            context: self.context.clone(),
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.code.exit_code()
    }
}

impl From<ErrorInfo> for BridgeError {
    fn from(info: ErrorInfo) -> Self {
        Self::new(info.code, info.message, info.context)
    }
}

impl Diagnostic for BridgeError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(self.code))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        let hint = match self.code {
            ErrorCode::SessionFaulted => "reset the session (disconnect + connect) before retrying",
            ErrorCode::NotConnected => "connect to a host first",
            ErrorCode::Locked => "press Reset or Clear, or run recovery",
            ErrorCode::Connect => "check the host is listening and allowed by configuration",
            _ => return None,
        };
        Some(Box::new(hint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_parse() {
        for code in ALL_CODES {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(*code));
        }
        assert_eq!(ErrorCode::parse("E_NOPE"), None);
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = BridgeError::locked("keyboard locked");
        assert_eq!(err.to_string(), "E_LOCKED: keyboard locked");
    }
}
