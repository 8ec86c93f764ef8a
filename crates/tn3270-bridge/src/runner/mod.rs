//! Flow execution against the action executor.
//!
//! A run walks `Pending -> Running -> {Succeeded | Failed | Recovered | Canceled}`.
//! When a step fails and the flow defines a recovery sequence, the sequence runs
//! once and the failed step is attempted exactly once more. Every attempt is
//! appended to the run log, with secret fill values replaced by the redaction marker.
//!
//! Cancellation is cooperative and only observed between steps; a session left
//! locked by a canceled run is driven through keyboard-lock recovery so it ends
//! `Ready` or `Faulted`.

pub mod progress;

pub use progress::{NoopProgress, ProgressCallback, ProgressEvent};

use crate::artifacts::{RunArtifacts, RunArtifactsConfig};
use crate::error::{BridgeError, BridgeResult, ErrorCode};
use crate::executor::ActionExecutor;
use crate::flow::validate_flow;
use crate::golden::{Comparison, GoldenRegistry, LayoutSignature};
use crate::model::{
    ActionResult, ActionStatus, ActionTarget, Credentials, FlowDefinition, FlowOutcome, Predicate,
    RunId, RunStatus, Screen, SessionState, Step, StepAction, StepPhase, StepRecord, StepStatus,
};
use crate::session::{LockPolicy, SessionHandle};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared between a run and its caller.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run inputs.
#[derive(Default)]
pub struct RunOptions<'a> {
    /// Substituted for `${user}` / `${secret}` in fill values.
    pub credentials: Credentials,
    pub cancel: CancelToken,
    pub progress: Option<&'a dyn ProgressCallback>,
    pub artifacts: Option<RunArtifactsConfig>,
    /// Existing session to run against. Sessions the flow opens itself are
    /// disconnected when the run ends.
    pub session: Option<SessionHandle>,
}

struct RunContext<'a> {
    session: Option<SessionHandle>,
    owned: bool,
    variables: &'a BTreeMap<String, String>,
    credentials: &'a Credentials,
    progress: &'a dyn ProgressCallback,
    artifacts: Option<RunArtifacts>,
    started: Instant,
}

impl RunContext<'_> {
    fn handle(&self) -> BridgeResult<SessionHandle> {
        self.session
            .clone()
            .ok_or_else(|| BridgeError::not_connected("flow has no session; add a connect step"))
    }
}

/// What a step will send, resolved before any I/O.
struct Prepared {
    action: String,
    value: Option<String>,
    redacted: bool,
}

/// Executes [`FlowDefinition`]s.
pub struct FlowRunner {
    executor: Arc<ActionExecutor>,
    goldens: Arc<GoldenRegistry>,
    sensitive: Regex,
    marker: String,
}

impl FlowRunner {
    pub fn new(executor: Arc<ActionExecutor>, goldens: Arc<GoldenRegistry>) -> BridgeResult<Self> {
        let redaction = executor.manager().config().redaction.clone();
        Ok(Self {
            sensitive: redaction.compile()?,
            marker: redaction.marker,
            executor,
            goldens,
        })
    }

    /// Run `flow` to completion, failure or cancellation.
    ///
    /// Step failures never surface as `Err`; they end the run as `Failed` with
    /// the full log. `Err` is reserved for an invalid flow or unwritable artifacts.
    pub fn run(&self, flow: &FlowDefinition, options: RunOptions<'_>) -> BridgeResult<FlowOutcome> {
        validate_flow(flow)?;
        let run_id = RunId::new();
        let noop = NoopProgress;
        let progress: &dyn ProgressCallback = match options.progress {
            Some(progress) => progress,
            None => &noop,
        };
        let mut ctx = RunContext {
            session: options.session.clone(),
            owned: false,
            variables: &flow.variables,
            credentials: &options.credentials,
            progress,
            artifacts: options.artifacts.map(RunArtifacts::new).transpose()?,
            started: Instant::now(),
        };
        if let Some(artifacts) = ctx.artifacts.as_mut() {
            artifacts.write_flow(flow)?;
        }

        let mut outcome = FlowOutcome::new(run_id, flow.name.clone());
        outcome.status = RunStatus::Running;
        tracing::info!(run = %run_id, flow = %flow.name, steps = flow.steps.len(), "flow started");
        ctx.progress.on_progress(&ProgressEvent::RunStarted {
            run_id,
            flow: flow.name.clone(),
            total_steps: flow.steps.len(),
        });

        let result = self.run_steps(flow, &mut ctx, &mut outcome, &options.cancel);
        match result {
            Ok(recovered) => {
                outcome.status = if recovered {
                    RunStatus::Recovered
                } else {
                    RunStatus::Succeeded
                };
            }
            Err(err) => {
                outcome.status = if err.code == ErrorCode::Canceled {
                    self.settle_canceled(&ctx);
                    RunStatus::Canceled
                } else {
                    RunStatus::Failed
                };
                outcome.error = Some(err.to_error_info());
            }
        }

        if ctx.owned {
            if let Some(handle) = ctx.session.take() {
                if let Err(err) = self.executor.disconnect(&handle) {
                    tracing::warn!(error = %err, "failed to disconnect flow session");
                }
            }
        }
        outcome.duration_ms = elapsed_ms(ctx.started);
        tracing::info!(run = %run_id, status = ?outcome.status, records = outcome.log.len(), "flow finished");
        ctx.progress.on_progress(&ProgressEvent::RunCompleted {
            run_id,
            status: outcome.status,
            duration_ms: outcome.duration_ms,
        });
        if let Some(artifacts) = ctx.artifacts.as_mut() {
            artifacts.write_outcome(&outcome)?;
        }
        Ok(outcome)
    }

    /// Returns whether any step needed recovery.
    fn run_steps(
        &self,
        flow: &FlowDefinition,
        ctx: &mut RunContext<'_>,
        outcome: &mut FlowOutcome,
        cancel: &CancelToken,
    ) -> BridgeResult<bool> {
        let mut recovered = false;
        for (index, step) in flow.steps.iter().enumerate() {
            if cancel.is_canceled() {
                return Err(BridgeError::canceled(format!(
                    "run canceled before step {} ({})",
                    index + 1,
                    step.label()
                )));
            }
            let Err(err) = self.attempt(ctx, outcome, index, StepPhase::Main, step)? else {
                continue;
            };
            if flow.recovery.is_empty() {
                return Err(err);
            }

            tracing::warn!(step = %step.label(), error = %err, "step failed, running recovery");
            ctx.progress.on_progress(&ProgressEvent::RecoveryStarted {
                failed_step: step.label(),
            });
            for (recovery_index, recovery_step) in flow.recovery.iter().enumerate() {
                if self
                    .attempt(ctx, outcome, recovery_index, StepPhase::Recovery, recovery_step)?
                    .is_err()
                {
                    break;
                }
            }
            self.attempt(ctx, outcome, index, StepPhase::Retry, step)??;
            recovered = true;
        }
        Ok(recovered)
    }

    /// Run one step and log it. The outer `Err` is an artifact write failure;
    /// the inner result is the step's own outcome.
    fn attempt(
        &self,
        ctx: &mut RunContext<'_>,
        outcome: &mut FlowOutcome,
        index: usize,
        phase: StepPhase,
        step: &Step,
    ) -> BridgeResult<BridgeResult<()>> {
        let started = Instant::now();
        let name = step.label();
        ctx.progress.on_progress(&ProgressEvent::StepStarted {
            step_index: index + 1,
            phase,
            name: name.clone(),
        });

        let (action, redacted, result) = match self.prepare(ctx, step) {
            Ok(prepared) => {
                let result = self.perform(ctx, step, prepared.value.as_deref());
                (prepared.action, prepared.redacted, result)
            }
            Err(err) => (step.action.tag().to_string(), false, Err(err)),
        };

        let screen = ctx
            .session
            .as_ref()
            .and_then(|handle| self.executor.manager().last_screen(handle).ok().flatten());
        let status = if result.is_ok() {
            StepStatus::Passed
        } else {
            StepStatus::Failed
        };
        let record = StepRecord {
            index,
            phase,
            step: name.clone(),
            action: action.clone(),
            status,
            duration_ms: elapsed_ms(started),
            screen_digest: screen.as_ref().map(Screen::content_digest),
            layout_signature: screen.as_ref().map(|s| LayoutSignature::of(s).digest()),
            redacted,
            error: result.as_ref().err().map(BridgeError::to_error_info),
        };
        tracing::debug!(step = %name, ?phase, ?status, %action, "step finished");
        ctx.progress.on_progress(&ProgressEvent::StepCompleted {
            step_index: index + 1,
            phase,
            name,
            action,
            status,
            duration_ms: record.duration_ms,
            detail: result.as_ref().err().map(|err| err.message.clone()),
        });
        if let Some(artifacts) = ctx.artifacts.as_mut() {
            artifacts.append_record(&record)?;
            if let (Err(err), Some(screen)) = (&result, screen.as_ref()) {
                let text = self.mask_secret(screen.text(), ctx.credentials);
                artifacts.write_failure_screen(&record.step, &err.to_string(), &text)?;
            }
        }
        outcome.log.append(record);
        Ok(result)
    }

    /// Resolve substitutions and the loggable description of a step.
    fn prepare(&self, ctx: &RunContext<'_>, step: &Step) -> BridgeResult<Prepared> {
        let plain = |action: String| Prepared {
            action,
            value: None,
            redacted: false,
        };
        Ok(match &step.action {
            StepAction::Connect { host } => {
                let host = host
                    .clone()
                    .unwrap_or_else(|| self.executor.manager().config().default_host.clone());
                plain(format!("connect {host}"))
            }
            StepAction::Disconnect => plain("disconnect".to_string()),
            StepAction::Wait(condition) => plain(format!("wait {condition}")),
            StepAction::Press { key } => plain(format!("press {key}")),
            StepAction::Assert(predicate) => plain(format!("assert {predicate}")),
            StepAction::SaveGolden { golden } => plain(format!("save_golden {golden}")),
            StepAction::Recover => plain("recover".to_string()),
            StepAction::Fill { target, value } => {
                let (resolved, uses_secret) = substitute(value, ctx.variables, ctx.credentials)?;
                let redacted = uses_secret
                    || self.is_sensitive(step, target)
                    || ctx
                        .credentials
                        .secret
                        .as_deref()
                        .is_some_and(|secret| !secret.is_empty() && resolved.contains(secret));
                let shown = if redacted {
                    self.marker.clone()
                } else {
                    resolved.clone()
                };
                Prepared {
                    action: format!("fill {target} value='{shown}'"),
                    value: Some(resolved),
                    redacted,
                }
            }
        })
    }

    fn mask_secret(&self, text: String, credentials: &Credentials) -> String {
        match credentials.secret.as_deref() {
            Some(secret) if !secret.is_empty() => text.replace(secret, &self.marker),
            _ => text,
        }
    }

    fn is_sensitive(&self, step: &Step, target: &ActionTarget) -> bool {
        let named = step
            .name
            .as_deref()
            .is_some_and(|name| self.sensitive.is_match(name));
        let labelled = matches!(target, ActionTarget::Label { label, .. } if self.sensitive.is_match(label));
        named || labelled
    }

    fn perform(&self, ctx: &mut RunContext<'_>, step: &Step, value: Option<&str>) -> BridgeResult<()> {
        let timeout = step.timeout_ms.map(Duration::from_millis);
        match &step.action {
            StepAction::Connect { host } => {
                let connected = ctx
                    .session
                    .as_ref()
                    .and_then(|handle| self.executor.manager().status(handle).ok())
                    .is_some_and(|status| status.state.is_connected());
                if !connected {
                    let handle = self.executor.connect(host.as_deref(), timeout)?;
                    ctx.session = Some(handle);
                    ctx.owned = true;
                }
                Ok(())
            }
            StepAction::Disconnect => {
                let handle = ctx.handle()?;
                ctx.session = None;
                ctx.owned = false;
                self.executor.disconnect(&handle)
            }
            StepAction::Wait(condition) => {
                expect_ok(self.executor.wait(&ctx.handle()?, condition, timeout)?)
            }
            StepAction::Fill { target, .. } => {
                let handle = ctx.handle()?;
                let value = value.unwrap_or_default();
                let result = match target {
                    ActionTarget::Position { row, col } => {
                        self.executor.fill_at(&handle, *row, *col, value, timeout)?
                    }
                    ActionTarget::Label { label, offset } => {
                        self.executor
                            .fill_by_label(&handle, label, value, *offset, timeout)?
                    }
                };
                expect_ok(result)
            }
            StepAction::Press { key } => {
                expect_ok(self.executor.press_key(&ctx.handle()?, *key, timeout)?)
            }
            StepAction::Assert(predicate) => self.evaluate(&ctx.handle()?, predicate, timeout),
            StepAction::SaveGolden { golden } => {
                let screen = self.capture(&ctx.handle()?, timeout, LockPolicy::RequireUnlocked)?;
                self.goldens.save(golden, &screen).map(|_| ())
            }
            StepAction::Recover => {
                let report = self.executor.recover(&ctx.handle()?)?;
                if report.final_state == SessionState::Ready {
                    Ok(())
                } else {
                    Err(BridgeError::faulted(format!(
                        "keyboard still locked after {} recovery attempts",
                        report.attempts
                    )))
                }
            }
        }
    }

    fn capture(&self, handle: &SessionHandle, timeout: Option<Duration>, policy: LockPolicy) -> BridgeResult<Screen> {
        let config = self.executor.manager().config();
        let timeout = timeout.unwrap_or_else(|| config.timeouts.capture());
        self.executor.manager().capture_screen(handle, timeout, policy)
    }

    /// Check a predicate against a fresh capture.
    fn evaluate(&self, handle: &SessionHandle, predicate: &Predicate, timeout: Option<Duration>) -> BridgeResult<()> {
        let screen = self.capture(handle, timeout, LockPolicy::AcceptLocked)?;
        if self.holds(predicate, &screen)? {
            Ok(())
        } else {
            Err(BridgeError::assertion(
                format!("assertion failed: {predicate}"),
                serde_json::json!({
                    "predicate": predicate,
                    "cursor": screen.cursor(),
                    "keyboard_locked": screen.keyboard_locked(),
                }),
            ))
        }
    }

    fn holds(&self, predicate: &Predicate, screen: &Screen) -> BridgeResult<bool> {
        Ok(match predicate {
            Predicate::TextPresent { text } => screen.contains(text),
            Predicate::TextAbsent { text } => !screen.contains(text),
            Predicate::MessageContains { text } => {
                let row = self.executor.manager().config().message_row(screen.rows());
                screen
                    .message_line(row)
                    .is_some_and(|line| line.contains(text.as_str()))
            }
            Predicate::CursorAt { row, col } => {
                let cursor = screen.cursor();
                cursor.row == *row && cursor.col == *col
            }
            Predicate::FieldEquals {
                label,
                offset,
                value,
            } => field_text(screen, label, *offset)? == value.as_str(),
            Predicate::Golden { name } => match self.goldens.compare(name, screen)? {
                Comparison::Match => true,
                Comparison::Mismatch { diffs } => {
                    return Err(BridgeError::golden(
                        format!("screen does not match golden '{name}'"),
                        serde_json::json!({"name": name, "diffs": diffs}),
                    ));
                }
            },
            Predicate::KeyboardUnlocked => !screen.keyboard_locked(),
            Predicate::Matches { pattern } => {
                let regex = Regex::new(pattern).map_err(|err| {
                    BridgeError::validation(
                        "invalid pattern in matches predicate",
                        serde_json::json!({"pattern": pattern, "source": err.to_string()}),
                    )
                })?;
                regex.is_match(&screen.text())
            }
            Predicate::All { predicates } => {
                for member in predicates {
                    if !self.holds(member, screen)? {
                        return Ok(false);
                    }
                }
                true
            }
            // A member that cannot hold (missing field, golden mismatch) just
            // does not satisfy the group.
            Predicate::Any { predicates } => predicates.iter().any(|member| {
                self.holds(member, screen).unwrap_or_else(|err| {
                    tracing::debug!(predicate = %member, error = %err, "group member failed");
                    false
                })
            }),
        })
    }

    /// A canceled run never leaves its session locked.
    fn settle_canceled(&self, ctx: &RunContext<'_>) {
        let Some(handle) = ctx.session.as_ref() else {
            return;
        };
        let locked = self
            .executor
            .manager()
            .status(handle)
            .is_ok_and(|status| status.state == SessionState::Locked);
        if locked {
            match self.executor.recover(handle) {
                Ok(report) => tracing::info!(state = ?report.final_state, "canceled run settled"),
                Err(err) => tracing::warn!(error = %err, "recovery after cancel failed"),
            }
        }
    }
}

/// Text of the input field a fill with the same `label`/`offset` would target.
fn field_text<'s>(screen: &'s Screen, label: &str, offset: usize) -> BridgeResult<&'s str> {
    screen
        .find_label(label)
        .and_then(|index| screen.input_field_after(index, offset))
        .map(|field| field.text())
        .ok_or_else(|| {
            BridgeError::not_found(
                format!("no field for label '{label}'"),
                serde_json::json!({"label": label, "offset": offset}),
            )
        })
}

/// Turn a non-ok action result into the matching error.
fn expect_ok(result: ActionResult) -> BridgeResult<()> {
    let code = match result.status {
        ActionStatus::Ok => return Ok(()),
        ActionStatus::Locked => ErrorCode::Locked,
        ActionStatus::Timeout => ErrorCode::Timeout,
        ActionStatus::ProtocolError => ErrorCode::Protocol,
        ActionStatus::NotFound => ErrorCode::NotFound,
    };
    Err(BridgeError::new(
        code,
        result.detail.unwrap_or_else(|| format!("{:?}", result.status)),
        result.context,
    ))
}

/// Expand `${user}`, `${secret}` and flow variables. Returns the value and
/// whether the secret was used.
pub fn substitute(
    template: &str,
    variables: &BTreeMap<String, String>,
    credentials: &Credentials,
) -> BridgeResult<(String, bool)> {
    let mut out = String::with_capacity(template.len());
    let mut uses_secret = false;
    let mut rest = template;
    while let Some((before, after)) = rest.split_once("${") {
        out.push_str(before);
        let Some((name, tail)) = after.split_once('}') else {
            return Err(BridgeError::validation(
                "unterminated ${...} in fill value",
                serde_json::json!({"at": before.len()}),
            ));
        };
        let value = match name {
            "user" => credentials.user.clone(),
            "secret" => {
                uses_secret = true;
                credentials.secret.clone()
            }
            other => variables.get(other).cloned(),
        };
        let Some(value) = value else {
            return Err(BridgeError::validation(
                format!("no value for ${{{name}}}"),
                serde_json::json!({"variable": name}),
            ));
        };
        out.push_str(&value);
        rest = tail;
    }
    out.push_str(rest);
    Ok((out, uses_secret))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_credentials_and_variables() {
        let mut variables = BTreeMap::new();
        variables.insert("applid".to_string(), "TSO".to_string());
        let creds = Credentials::new("HERC02", "CUL8TR");

        let (value, secret) =
            substitute("${applid} ${user}", &variables, &creds).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(value, "TSO HERC02");
        assert!(!secret);

        let (value, secret) =
            substitute("${secret}", &variables, &creds).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(value, "CUL8TR");
        assert!(secret);
    }

    #[test]
    fn missing_values_are_validation_errors() {
        let creds = Credentials::default();
        let err = substitute("${secret}", &BTreeMap::new(), &creds).err();
        assert_eq!(err.map(|e| e.code), Some(ErrorCode::Validation));
        assert!(substitute("${user", &BTreeMap::new(), &creds).is_err());
        let plain = substitute("no vars $ here", &BTreeMap::new(), &creds);
        assert_eq!(plain.ok().map(|(v, _)| v), Some("no vars $ here".to_string()));
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_canceled());
        clone.cancel();
        assert!(token.is_canceled());
    }
}
