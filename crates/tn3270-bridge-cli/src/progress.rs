//! Step-by-step progress output using indicatif.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::sync::Mutex;
use tn3270_bridge::runner::{ProgressCallback, ProgressEvent};
use tn3270_bridge::{RunStatus, StepPhase, StepStatus};

/// Progress callback that writes to stderr, leaving stdout for JSON results.
pub struct VerboseProgress {
    spinner: Mutex<Option<ProgressBar>>,
    total_steps: Mutex<usize>,
}

impl VerboseProgress {
    pub fn new() -> Self {
        Self {
            spinner: Mutex::new(None),
            total_steps: Mutex::new(0),
        }
    }

    fn clear_spinner(&self) {
        if let Ok(mut spinner) = self.spinner.lock() {
            if let Some(pb) = spinner.take() {
                pb.finish_and_clear();
            }
        }
    }
}

fn phase_tag(phase: StepPhase) -> &'static str {
    match phase {
        StepPhase::Main => "",
        StepPhase::Recovery => " [recovery]",
        StepPhase::Retry => " [retry]",
    }
}

impl ProgressCallback for VerboseProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::RunStarted {
                run_id,
                flow,
                total_steps,
            } => {
                if let Ok(mut total) = self.total_steps.lock() {
                    *total = *total_steps;
                }
                let _ = writeln!(
                    std::io::stderr(),
                    "run started: {flow} {run_id} ({total_steps} steps)"
                );
            }
            ProgressEvent::StepStarted {
                step_index,
                phase,
                name,
            } => {
                let total = self.total_steps.lock().map(|g| *g).unwrap_or(0);
                let pb = ProgressBar::new_spinner();
                pb.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                pb.set_message(format!("[{step_index}/{total}]{} {name}", phase_tag(*phase)));
                pb.enable_steady_tick(std::time::Duration::from_millis(100));
                if let Ok(mut spinner) = self.spinner.lock() {
                    *spinner = Some(pb);
                }
            }
            ProgressEvent::StepCompleted {
                phase,
                name,
                action,
                status,
                duration_ms,
                detail,
                ..
            } => {
                self.clear_spinner();
                let icon = match status {
                    StepStatus::Passed => "\x1b[32m✓\x1b[0m",
                    StepStatus::Failed => "\x1b[31m✗\x1b[0m",
                };
                let _ = writeln!(
                    std::io::stderr(),
                    "  {icon} {name}{} ({duration_ms}ms) {action}",
                    phase_tag(*phase)
                );
                if let Some(detail) = detail {
                    let _ = writeln!(std::io::stderr(), "      {detail}");
                }
            }
            ProgressEvent::RecoveryStarted { failed_step } => {
                let _ = writeln!(
                    std::io::stderr(),
                    "  \x1b[33m↻\x1b[0m running recovery for {failed_step}"
                );
            }
            ProgressEvent::RunCompleted {
                status,
                duration_ms,
                ..
            } => {
                self.clear_spinner();
                let label = match status {
                    RunStatus::Succeeded => "\x1b[32msucceeded\x1b[0m",
                    RunStatus::Recovered => "\x1b[33mrecovered\x1b[0m",
                    RunStatus::Canceled => "\x1b[90mcanceled\x1b[0m",
                    RunStatus::Failed | RunStatus::Pending | RunStatus::Running => {
                        "\x1b[31mfailed\x1b[0m"
                    }
                };
                let _ = writeln!(std::io::stderr(), "run {label}: {duration_ms}ms total");
            }
        }
    }
}
