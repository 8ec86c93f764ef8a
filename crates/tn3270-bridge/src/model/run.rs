use crate::model::{ErrorInfo, RunId, FLOW_VERSION};
use serde::{Deserialize, Serialize};

/// Flow run state machine: `Pending -> Running -> {Succeeded | Failed | Recovered | Canceled}`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Completed, but at least one step needed the recovery sequence.
    Recovered,
    Canceled,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded | Self::Recovered)
    }
}

/// Which pass through the flow produced a record.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Main,
    Recovery,
    Retry,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
}

/// One append-only run log entry.
///
/// `action` is the exact directive description sent to the host, with secret
/// values already replaced by the redaction marker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub phase: StepPhase,
    pub step: String,
    pub action: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_signature: Option<String>,
    #[serde(default)]
    pub redacted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Ordered, append-only record of a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    records: Vec<StepRecord>,
}

impl RunLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: StepRecord) {
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<&StepRecord> {
        self.records.last()
    }
}

impl FromIterator<StepRecord> for RunLog {
    fn from_iter<I: IntoIterator<Item = StepRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

/// Result of running one flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowOutcome {
    pub flow_version: u32,
    pub run_id: RunId,
    pub flow: String,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub log: RunLog,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl FlowOutcome {
    #[must_use]
    pub fn new(run_id: RunId, flow: impl Into<String>) -> Self {
        Self {
            flow_version: FLOW_VERSION,
            run_id,
            flow: flow.into(),
            status: RunStatus::Pending,
            duration_ms: 0,
            log: RunLog::new(),
            error: None,
        }
    }
}
