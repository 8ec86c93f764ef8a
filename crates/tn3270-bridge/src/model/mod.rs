pub mod action;
pub mod flow;
pub mod ids;
pub mod run;
pub mod screen;

pub use action::*;
pub use flow::*;
pub use ids::{RunId, SessionId};
pub use run::*;
pub use screen::*;

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version stamped on run logs and flow documents.
pub const FLOW_VERSION: u32 = 1;

/// Serializable error projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Lifecycle of one session.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Locked,
    Faulted,
}

impl SessionState {
    /// Live wire to the host, possibly locked.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Ready | Self::Locked)
    }
}

/// Point-in-time view of a session, safe to hand to callers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: SessionId,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<String>,
    /// Milliseconds since the last action, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action_age_ms: Option<u64>,
    pub action_count: u64,
    pub error_count: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Body of the health endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub connected: bool,
    pub uptime_secs: u64,
    #[serde(default)]
    pub last_action: Option<String>,
    pub action_count: u64,
    pub error_count: u64,
    pub reconnect_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionStatus>,
}
