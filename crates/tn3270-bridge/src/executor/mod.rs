//! Validated, stateless action requests against a session.
//!
//! The executor is the layer callers talk to. It checks every request before
//! any I/O (coordinates, protection, length, key names), resolves label targets
//! against a fresh capture, and keeps the health counters reported by `/healthz`.

use crate::error::{BridgeError, BridgeResult, ErrorCode};
use crate::model::{
    ActionKind, ActionRequest, ActionResult, ActionStatus, ActionTarget, HealthReport,
    HealthStatus, Key, Screen, SessionStatus, WaitCondition,
};
use crate::session::{LockPolicy, RecoveryReport, SessionHandle, SessionManager};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Counters {
    last_action: Option<String>,
    action_count: u64,
    error_count: u64,
    reconnect_count: u64,
}

/// Front door for all screen actions.
pub struct ActionExecutor {
    manager: Arc<SessionManager>,
    started: Instant,
    counters: Mutex<Counters>,
}

impl ActionExecutor {
    #[must_use]
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    fn default_timeout(&self) -> Duration {
        self.manager.config().timeouts.action()
    }

    fn record(&self, label: impl Into<String>, succeeded: bool) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.last_action = Some(label.into());
            counters.action_count += 1;
            if !succeeded {
                counters.error_count += 1;
            }
        }
    }

    fn track(
        &self,
        label: impl Into<String>,
        result: BridgeResult<ActionResult>,
    ) -> BridgeResult<ActionResult> {
        let succeeded = result.as_ref().is_ok_and(ActionResult::is_ok);
        self.record(label, succeeded);
        result
    }

    /// Connect to `host`, or the configured default host.
    pub fn connect(&self, host: Option<&str>, timeout: Option<Duration>) -> BridgeResult<SessionHandle> {
        let config = self.manager.config();
        let host = host.unwrap_or(&config.default_host).to_string();
        let timeout = timeout.unwrap_or_else(|| config.timeouts.connect());
        let result = self.manager.connect(&host, timeout);
        self.record("connect", result.is_ok());
        result
    }

    pub fn disconnect(&self, handle: &SessionHandle) -> BridgeResult<()> {
        let result = self.manager.disconnect(handle);
        self.record("disconnect", result.is_ok());
        result
    }

    /// Tear down and reconnect; counted as a reconnect in health.
    pub fn reset(&self, handle: &SessionHandle, timeout: Option<Duration>) -> BridgeResult<SessionStatus> {
        let timeout = timeout.unwrap_or_else(|| self.manager.config().timeouts.connect());
        let result = self.manager.reset(handle, timeout);
        if let Ok(mut counters) = self.counters.lock() {
            counters.reconnect_count += 1;
        }
        self.record("reset", result.is_ok());
        result
    }

    pub fn read_screen(&self, handle: &SessionHandle, timeout: Option<Duration>) -> BridgeResult<ActionResult> {
        let mut request = ActionRequest::new(ActionKind::ReadScreen);
        request.timeout_ms = timeout.map(duration_ms);
        let result = self.manager.send_action(handle, &request);
        self.track("read_screen", result)
    }

    /// Type `value` into the field at (`row`, `col`).
    ///
    /// # Errors
    /// `E_VALIDATION` without any I/O when the position is off the grid, inside a
    /// protected field, the value carries control characters, or it is longer
    /// than the room left in the field.
    pub fn fill_at(
        &self,
        handle: &SessionHandle,
        row: u16,
        col: u16,
        value: &str,
        timeout: Option<Duration>,
    ) -> BridgeResult<ActionResult> {
        let max_age = self.manager.config().screen.max_age();
        let cached = self
            .manager
            .last_screen(handle)?
            .filter(|screen| !screen.is_stale(max_age));
        let screen = match cached {
            Some(screen) => screen,
            None => match self.fresh_screen(handle, timeout) {
                Ok(screen) => screen,
                Err(result) => return self.track("fill", result),
            },
        };
        if let Err(err) = validate_fill(&screen, row, col, value) {
            self.record("fill", false);
            return Err(err);
        }
        let request = fill_request(ActionKind::Fill, row, col, value, timeout);
        let result = self.manager.send_action(handle, &request);
        self.track("fill", result)
    }

    /// Fill the input field found relative to a label on the current screen.
    ///
    /// A missing label or input field is an [`ActionStatus::NotFound`] result.
    pub fn fill_by_label(
        &self,
        handle: &SessionHandle,
        label: &str,
        value: &str,
        offset: usize,
        timeout: Option<Duration>,
    ) -> BridgeResult<ActionResult> {
        self.ensure_allowed(ActionKind::FillByLabel)?;
        let screen = match self.fresh_screen(handle, timeout) {
            Ok(screen) => screen,
            Err(result) => return self.track("fill_by_label", result),
        };
        let target = screen
            .find_label(label)
            .and_then(|index| screen.input_field_after(index, offset))
            .map(|field| (field.row, field.col));
        let Some((row, col)) = target else {
            let err = BridgeError::not_found(
                format!("no input field for label '{label}'"),
                serde_json::json!({"label": label, "offset": offset}),
            );
            tracing::debug!(label, offset, "label not found");
            return self.track(
                "fill_by_label",
                Ok(ActionResult::failed(ActionStatus::NotFound, Some(screen), &err)),
            );
        };
        if let Err(err) = validate_fill(&screen, row, col, value) {
            self.record("fill_by_label", false);
            return Err(err);
        }
        let request = fill_request(ActionKind::FillByLabel, row, col, value, timeout);
        let result = self.manager.send_action(handle, &request);
        self.track("fill_by_label", result)
    }

    /// Press a key by name.
    ///
    /// # Errors
    /// `E_VALIDATION` listing the supported keys when `key` is not one of them.
    pub fn press(&self, handle: &SessionHandle, key: &str, timeout: Option<Duration>) -> BridgeResult<ActionResult> {
        let key = match Key::parse(key) {
            Ok(key) => key,
            Err(err) => {
                self.record("press", false);
                return Err(err);
            }
        };
        self.press_key(handle, key, timeout)
    }

    pub fn press_key(&self, handle: &SessionHandle, key: Key, timeout: Option<Duration>) -> BridgeResult<ActionResult> {
        let mut request = ActionRequest::new(ActionKind::Press).with_payload(key.to_string());
        request.timeout_ms = timeout.map(duration_ms);
        let result = self.manager.send_action(handle, &request);
        self.track(key.to_string(), result)
    }

    pub fn wait(
        &self,
        handle: &SessionHandle,
        condition: &WaitCondition,
        timeout: Option<Duration>,
    ) -> BridgeResult<ActionResult> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        let result = self.manager.wait_for(handle, condition, timeout);
        self.track("wait", result)
    }

    pub fn recover(&self, handle: &SessionHandle) -> BridgeResult<RecoveryReport> {
        let result = self.manager.recover(handle);
        let succeeded = result
            .as_ref()
            .is_ok_and(|report| report.final_state.is_connected());
        self.record("recover", succeeded);
        result
    }

    /// Health snapshot; `Degraded` unless `handle` is connected.
    pub fn health(&self, handle: Option<&SessionHandle>) -> HealthReport {
        let session = handle.and_then(|handle| self.manager.status(handle).ok());
        let connected = session
            .as_ref()
            .is_some_and(|status| status.state.is_connected());
        let (last_action, action_count, error_count, reconnect_count) = self
            .counters
            .lock()
            .map(|c| (c.last_action.clone(), c.action_count, c.error_count, c.reconnect_count))
            .unwrap_or_default();
        HealthReport {
            status: if connected {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            connected,
            uptime_secs: self.started.elapsed().as_secs(),
            last_action,
            action_count,
            error_count,
            reconnect_count,
            session,
        }
    }

    fn ensure_allowed(&self, kind: ActionKind) -> BridgeResult<()> {
        if self.manager.config().allows_action(kind) {
            Ok(())
        } else {
            Err(BridgeError::validation(
                format!("action '{kind}' is not allowed"),
                serde_json::json!({"action": kind}),
            ))
        }
    }

    /// Capture that requires an unlocked keyboard. Lock and timeout come back
    /// as a ready-made failed result.
    fn fresh_screen(
        &self,
        handle: &SessionHandle,
        timeout: Option<Duration>,
    ) -> Result<Screen, BridgeResult<ActionResult>> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        let was_live = self
            .manager
            .status(handle)
            .is_ok_and(|status| status.state.is_connected());
        match self
            .manager
            .capture_screen(handle, timeout, LockPolicy::RequireUnlocked)
        {
            Ok(screen) => Ok(screen),
            Err(err) => {
                let status = match err.code {
                    ErrorCode::Locked => ActionStatus::Locked,
                    ErrorCode::Timeout => ActionStatus::Timeout,
                    ErrorCode::Protocol | ErrorCode::SessionFaulted if was_live => {
                        ActionStatus::ProtocolError
                    }
                    _ => return Err(Err(err)),
                };
                let screen = self.manager.last_screen(handle).ok().flatten();
                Err(Ok(ActionResult::failed(status, screen, &err)))
            }
        }
    }
}

/// A resolved fill; `kind` is the action the caller was allowed to run.
fn fill_request(
    kind: ActionKind,
    row: u16,
    col: u16,
    value: &str,
    timeout: Option<Duration>,
) -> ActionRequest {
    let mut request = ActionRequest::new(kind)
        .with_target(ActionTarget::Position { row, col })
        .with_payload(value);
    request.timeout_ms = timeout.map(duration_ms);
    request
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Pre-flight checks for a fill against the last known screen.
pub fn validate_fill(screen: &Screen, row: u16, col: u16, value: &str) -> BridgeResult<()> {
    if row >= screen.rows() || col >= screen.cols() {
        return Err(BridgeError::validation(
            format!("position ({row},{col}) is outside the screen"),
            serde_json::json!({
                "row": row,
                "col": col,
                "rows": screen.rows(),
                "cols": screen.cols(),
            }),
        ));
    }
    // A newline or carriage return ends a script command line.
    if let Some(position) = value.chars().position(char::is_control) {
        return Err(BridgeError::validation(
            "value contains control characters",
            serde_json::json!({"row": row, "col": col, "position": position}),
        ));
    }
    let length = value.chars().count();
    let room = match screen.field_at(row, col) {
        Some(field) if field.protected => {
            return Err(BridgeError::validation(
                format!("position ({row},{col}) is in a protected field"),
                serde_json::json!({"row": row, "col": col, "field_col": field.col}),
            ));
        }
        Some(field) => usize::from(field.end_col() - col),
        // Attribute cell, or an unformatted screen where every cell takes input.
        None if screen.formatted() => {
            return Err(BridgeError::validation(
                format!("position ({row},{col}) is not inside an input field"),
                serde_json::json!({"row": row, "col": col}),
            ));
        }
        None => usize::from(screen.cols() - col),
    };
    if length > room {
        return Err(BridgeError::validation(
            format!("value of {length} characters does not fit in {room}"),
            serde_json::json!({"row": row, "col": col, "length": length, "room": room}),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cursor, Field};

    fn logon() -> Screen {
        Screen::from_fields(
            24,
            80,
            vec![
                Field::new(0, 0, 10, true, "Logon ===>"),
                Field::new(0, 11, 8, false, ""),
            ],
            Cursor::default(),
            false,
        )
    }

    #[test]
    fn fill_rejects_out_of_range_positions() {
        let err = validate_fill(&logon(), 24, 0, "x").err();
        assert_eq!(err.map(|e| e.code), Some(ErrorCode::Validation));
        let err = validate_fill(&logon(), 0, 80, "x").err();
        assert_eq!(err.map(|e| e.code), Some(ErrorCode::Validation));
    }

    #[test]
    fn fill_rejects_protected_and_overlong_values() {
        assert!(validate_fill(&logon(), 0, 2, "x").is_err());
        assert!(validate_fill(&logon(), 0, 11, "HERC02").is_ok());
        assert!(validate_fill(&logon(), 0, 11, "TOOLONGVALUE").is_err());
        assert!(validate_fill(&logon(), 0, 15, "ABCDE").is_err());
    }

    #[test]
    fn unformatted_screens_accept_input_anywhere() {
        let screen = Screen::from_fields(24, 80, Vec::new(), Cursor::default(), false);
        assert!(validate_fill(&screen, 23, 70, "logon").is_ok());
        assert!(validate_fill(&screen, 23, 78, "logon").is_err());
    }

    #[test]
    fn fill_rejects_control_characters() {
        for value in ["\nClear()", "HERC\r", "A\tB", "\u{1b}x"] {
            let err = validate_fill(&logon(), 0, 11, value).err();
            assert_eq!(err.map(|e| e.code), Some(ErrorCode::Validation), "{value:?}");
        }
    }
}
