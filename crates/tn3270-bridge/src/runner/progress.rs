//! Progress callback for reporting flow runs.
//!
//! The CLI renders these as spinners or feeds them to the TUI viewer.

use crate::model::{RunId, RunStatus, StepPhase, StepStatus};

/// Event emitted while a flow runs.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    RunStarted {
        run_id: RunId,
        flow: String,
        total_steps: usize,
    },
    StepStarted {
        /// 1-based position in its phase.
        step_index: usize,
        phase: StepPhase,
        name: String,
    },
    StepCompleted {
        step_index: usize,
        phase: StepPhase,
        name: String,
        /// Redacted description of what was sent.
        action: String,
        status: StepStatus,
        duration_ms: u64,
        detail: Option<String>,
    },
    /// The recovery sequence is about to run for a failed step.
    RecoveryStarted { failed_step: String },
    RunCompleted {
        run_id: RunId,
        status: RunStatus,
        duration_ms: u64,
    },
}

/// Receives progress events during a run.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

/// Discards all events.
pub struct NoopProgress;

impl ProgressCallback for NoopProgress {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// A progress callback that collects events for testing.
#[cfg(test)]
#[derive(Default)]
pub struct CollectingProgress {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

#[cfg(test)]
impl CollectingProgress {
    /// # Panics
    /// Panics if the mutex is poisoned (a prior panic during collection).
    #[allow(clippy::expect_used)]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .expect("progress mutex poisoned - prior panic during event collection")
            .clone()
    }
}

#[cfg(test)]
impl ProgressCallback for CollectingProgress {
    #[allow(clippy::expect_used)]
    fn on_progress(&self, event: &ProgressEvent) {
        self.events
            .lock()
            .expect("progress mutex poisoned")
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_keeps_event_order() {
        let progress = CollectingProgress::default();
        let run_id = RunId::new();
        progress.on_progress(&ProgressEvent::RunStarted {
            run_id,
            flow: "logon".to_string(),
            total_steps: 1,
        });
        NoopProgress.on_progress(&ProgressEvent::RecoveryStarted {
            failed_step: "ignored".to_string(),
        });
        progress.on_progress(&ProgressEvent::RunCompleted {
            run_id,
            status: RunStatus::Succeeded,
            duration_ms: 3,
        });

        let events = progress.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events.first(), Some(ProgressEvent::RunStarted { total_steps: 1, .. })));
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::RunCompleted { status: RunStatus::Succeeded, .. })
        ));
    }
}
