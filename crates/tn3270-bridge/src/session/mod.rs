//! Session management: one emulator subprocess per logical connection.
//!
//! [`SessionManager`] owns a keyed table of sessions. Each [`SessionHandle`]
//! serializes access to its session behind its own mutex, so a session has at
//! most one in-flight exchange while independent sessions proceed concurrently.
//!
//! # Key Operations
//!
//! - [`SessionManager::connect`] - spawn the emulator, connect, block until the host presents an input field
//! - [`SessionManager::capture_screen`] - dump and decode the buffer
//! - [`SessionManager::send_action`] - dispatch an allowlisted action and re-capture
//! - [`SessionManager::recover`] - drive a locked keyboard back to `Ready` or give up as `Faulted`
//! - [`SessionManager::wait_for`] - block on an emulator-side signal until a condition holds
//! - [`SessionManager::disconnect`] / [`SessionManager::reset`]
//!
//! A session that sees its emulator crash, hang or answer with garbage moves to
//! `Faulted`; its subprocess is torn down and every later call fails with
//! `E_SESSION_FAULTED` until the caller resets it.

use crate::config::BridgeConfig;
use crate::decoder::{Geometry, ScreenDecoder};
use crate::emulator::{Emulator, EmulatorLauncher, S3270Launcher};
use crate::error::{BridgeError, BridgeResult, ErrorCode};
use crate::model::{
    ActionKind, ActionRequest, ActionResult, ActionStatus, ActionTarget, Key, Screen, SessionId,
    SessionState, SessionStatus, WaitCondition,
};
use crate::protocol::{ScriptCommand, ScriptReply, WaitFor};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Emulator reply fragments that mark a connect failure as worth retrying.
const TRANSIENT_CONNECT_ERRORS: &[&str] = &[
    "refused",
    "timed out",
    "unreachable",
    "not listening",
    "temporarily",
    "reset by peer",
];

/// Whether a capture may return while the keyboard is locked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockPolicy {
    RequireUnlocked,
    /// Used by recovery, which needs to see the lock.
    AcceptLocked,
}

/// How a recovery attempt ended.
#[derive(Clone, Debug, Serialize)]
pub struct RecoveryReport {
    pub final_state: SessionState,
    pub attempts: u32,
    pub keys: Vec<Key>,
}

/// Mutable state of one connection. Only reachable through its handle's lock.
pub struct Session {
    id: SessionId,
    state: SessionState,
    host: Option<String>,
    emulator: Option<Emulator>,
    last_screen: Option<Screen>,
    /// Digest of the screen as it stood before the last fill or key.
    baseline_digest: Option<String>,
    retry_count: u32,
    last_action: Option<String>,
    last_action_at: Option<Instant>,
    action_count: u64,
    error_count: u64,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Disconnected,
            host: None,
            emulator: None,
            last_screen: None,
            baseline_digest: None,
            retry_count: 0,
            last_action: None,
            last_action_at: None,
            action_count: 0,
            error_count: 0,
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id,
            state: self.state,
            host: self.host.clone(),
            retry_count: self.retry_count,
            last_action: self.last_action.clone(),
            last_action_age_ms: self
                .last_action_at
                .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)),
            action_count: self.action_count,
            error_count: self.error_count,
        }
    }

    fn note_action(&mut self, label: impl Into<String>, succeeded: bool) {
        self.last_action = Some(label.into());
        self.last_action_at = Some(Instant::now());
        self.action_count += 1;
        if !succeeded {
            self.error_count += 1;
        }
    }

    fn ensure_live(&self) -> BridgeResult<()> {
        match self.state {
            SessionState::Ready | SessionState::Locked => Ok(()),
            SessionState::Faulted => Err(BridgeError::faulted(format!(
                "session {} is faulted; reset required",
                self.id
            ))),
            SessionState::Disconnected | SessionState::Connecting => Err(
                BridgeError::not_connected(format!("session {} is not connected", self.id)),
            ),
        }
    }
}

/// Shared, cloneable reference to one session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    inner: Arc<Mutex<Session>>,
}

impl SessionHandle {
    fn new(session: Session) -> Self {
        Self {
            id: session.id,
            inner: Arc::new(Mutex::new(session)),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    fn lock(&self) -> BridgeResult<MutexGuard<'_, Session>> {
        self.inner
            .lock()
            .map_err(|_| BridgeError::internal("session lock poisoned"))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

enum Attempt {
    Transient(BridgeError),
    Fatal(BridgeError),
}

/// Owner of every session and the only path to an emulator.
pub struct SessionManager {
    config: Arc<BridgeConfig>,
    launcher: Arc<dyn EmulatorLauncher>,
    decoder: ScreenDecoder,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl SessionManager {
    /// Manager that launches the configured emulator program.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        let launcher = Arc::new(S3270Launcher::new(config.emulator.clone()));
        Self::with_launcher(config, launcher)
    }

    #[must_use]
    pub fn with_launcher(config: BridgeConfig, launcher: Arc<dyn EmulatorLauncher>) -> Self {
        let decoder = ScreenDecoder::new(&config.screen);
        Self {
            config: Arc::new(config),
            launcher,
            decoder,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn table(&self) -> BridgeResult<MutexGuard<'_, HashMap<SessionId, SessionHandle>>> {
        self.sessions
            .lock()
            .map_err(|_| BridgeError::internal("session table lock poisoned"))
    }

    fn ensure_allowed(&self, kind: ActionKind) -> BridgeResult<()> {
        if self.config.allows_action(kind) {
            return Ok(());
        }
        Err(BridgeError::validation(
            format!("action '{kind}' is not allowed"),
            serde_json::json!({"action": kind, "allowed": self.config.actions}),
        ))
    }

    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<SessionHandle> {
        self.table().ok().and_then(|table| table.get(&id).cloned())
    }

    pub fn sessions(&self) -> BridgeResult<Vec<SessionStatus>> {
        let handles: Vec<SessionHandle> = self.table()?.values().cloned().collect();
        handles
            .iter()
            .map(|handle| Ok(handle.lock()?.status()))
            .collect()
    }

    pub fn status(&self, handle: &SessionHandle) -> BridgeResult<SessionStatus> {
        Ok(handle.lock()?.status())
    }

    /// Most recent capture, if any.
    pub fn last_screen(&self, handle: &SessionHandle) -> BridgeResult<Option<Screen>> {
        Ok(handle.lock()?.last_screen.clone())
    }

    // =========================================================================
    // Connect / disconnect
    // =========================================================================

    /// Open a new session to `host`.
    ///
    /// Transient failures (connection refused, emulator not yet listening) are
    /// retried per the retry policy with exponential backoff after each failed
    /// attempt; anything else fails immediately.
    ///
    /// # Errors
    /// - `E_VALIDATION`: host not allowed or connect not allowlisted
    /// - `E_CONNECT`: emulator could not start or every attempt failed
    pub fn connect(&self, host: &str, timeout: Duration) -> BridgeResult<SessionHandle> {
        self.ensure_allowed(ActionKind::Connect)?;
        self.config.check_host(host)?;
        let mut session = Session::new(SessionId::new());
        self.establish(&mut session, host, timeout)?;
        session.note_action("connect", true);
        let handle = SessionHandle::new(session);
        self.table()?.insert(handle.id(), handle.clone());
        tracing::info!(session = %handle.id(), host, "session connected");
        Ok(handle)
    }

    fn establish(&self, session: &mut Session, host: &str, timeout: Duration) -> BridgeResult<()> {
        session.state = SessionState::Connecting;
        session.host = Some(host.to_string());
        let retry = self.config.retry;
        let mut last_error = None;
        for attempt in 1..=retry.max_attempts {
            match self.attempt_connect(session, host, timeout) {
                Ok(()) => {
                    session.retry_count = attempt - 1;
                    self.capture_inner(session, timeout, LockPolicy::AcceptLocked)?;
                    return Ok(());
                }
                Err(Attempt::Fatal(err)) => {
                    tracing::error!(host, attempt, error = %err, "connect failed");
                    self.teardown(session);
                    session.state = SessionState::Disconnected;
                    return Err(err);
                }
                Err(Attempt::Transient(err)) => {
                    session.retry_count = attempt;
                    let delay = retry.delay_after(attempt);
                    tracing::warn!(
                        host,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "connect attempt failed, backing off"
                    );
                    last_error = Some(err.to_error_info());
                    std::thread::sleep(delay);
                }
            }
        }
        self.teardown(session);
        session.state = SessionState::Disconnected;
        Err(BridgeError::connect(
            format!(
                "could not connect to {host} after {} attempts",
                retry.max_attempts
            ),
            serde_json::json!({
                "host": host,
                "attempts": retry.max_attempts,
                "last_error": last_error,
            }),
        ))
    }

    fn attempt_connect(
        &self,
        session: &mut Session,
        host: &str,
        timeout: Duration,
    ) -> Result<(), Attempt> {
        let alive = session.emulator.as_mut().is_some_and(Emulator::is_alive);
        if !alive {
            session.emulator = None;
            let io = self.launcher.launch().map_err(Attempt::Fatal)?;
            session.emulator = Some(Emulator::new(io));
        }
        let Some(emulator) = session.emulator.as_mut() else {
            return Err(Attempt::Fatal(BridgeError::internal("emulator missing")));
        };

        let connect = ScriptCommand::Connect {
            host: host.to_string(),
        };
        let reply = match emulator.execute(&connect, timeout) {
            Ok(reply) => reply,
            Err(err) => {
                session.emulator = None;
                return Err(Attempt::Transient(err));
            }
        };
        if !reply.ok {
            let message = reply.message();
            let err = BridgeError::connect(
                format!("connect to {host} failed: {message}"),
                serde_json::json!({"host": host, "reply": message}),
            );
            let lowered = message.to_ascii_lowercase();
            return Err(
                if TRANSIENT_CONNECT_ERRORS.iter().any(|t| lowered.contains(t)) {
                    Attempt::Transient(err)
                } else {
                    Attempt::Fatal(err)
                },
            );
        }
        if !reply.status.is_connected() {
            return Err(Attempt::Transient(BridgeError::connect(
                format!("{host} is not accepting connections"),
                serde_json::json!({"host": host}),
            )));
        }

        let ready = ScriptCommand::Wait {
            secs: wait_secs(timeout),
            until: WaitFor::InputField,
        };
        match emulator.execute(&ready, timeout) {
            Ok(reply) if reply.ok => Ok(()),
            Ok(reply) => Err(Attempt::Transient(BridgeError::timeout(
                "host never presented an input field",
                serde_json::json!({"host": host, "reply": reply.message()}),
            ))),
            Err(err) => {
                session.emulator = None;
                Err(Attempt::Transient(err))
            }
        }
    }

    /// Disconnect and forget a session. Always succeeds from the caller's view:
    /// the wire disconnect is best effort and the subprocess is killed after the grace period.
    pub fn disconnect(&self, handle: &SessionHandle) -> BridgeResult<()> {
        if let Ok(mut table) = self.table() {
            table.remove(&handle.id());
        }
        let mut session = handle.lock()?;
        self.close_wire(&mut session);
        session.state = SessionState::Disconnected;
        session.last_screen = None;
        session.baseline_digest = None;
        session.note_action("disconnect", true);
        tracing::info!(session = %session.id, "session disconnected");
        Ok(())
    }

    /// Disconnect every session in the table.
    pub fn disconnect_all(&self) {
        let handles: Vec<SessionHandle> = self
            .table()
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default();
        for handle in handles {
            if let Err(err) = self.disconnect(&handle) {
                tracing::warn!(session = %handle.id(), error = %err, "disconnect failed");
            }
        }
    }

    /// Disconnect and reconnect to the same host, keeping the session id.
    pub fn reset(&self, handle: &SessionHandle, timeout: Duration) -> BridgeResult<SessionStatus> {
        self.ensure_allowed(ActionKind::Connect)?;
        let mut session = handle.lock()?;
        let host = session
            .host
            .clone()
            .unwrap_or_else(|| self.config.default_host.clone());
        self.close_wire(&mut session);
        session.last_screen = None;
        session.baseline_digest = None;
        let result = self.establish(&mut session, &host, timeout);
        session.note_action("reset", result.is_ok());
        result?;
        tracing::info!(session = %session.id, host, "session reset");
        Ok(session.status())
    }

    fn close_wire(&self, session: &mut Session) {
        if let Some(emulator) = session.emulator.as_mut() {
            if emulator.is_alive() {
                let grace = self.config.timeouts.disconnect_grace();
                if let Err(err) = emulator.execute(&ScriptCommand::Disconnect, grace) {
                    tracing::debug!(error = %err, "disconnect directive not acknowledged");
                }
            }
        }
        self.teardown(session);
    }

    fn teardown(&self, session: &mut Session) {
        if let Some(mut emulator) = session.emulator.take() {
            if let Err(err) = emulator.shutdown(self.config.timeouts.disconnect_grace()) {
                tracing::warn!(session = %session.id, error = %err, "emulator shutdown failed");
            }
        }
    }

    fn fault(&self, session: &mut Session, err: &BridgeError) {
        tracing::error!(session = %session.id, error = %err, "session faulted");
        session.state = SessionState::Faulted;
        self.teardown(session);
    }

    // =========================================================================
    // Exchanges
    // =========================================================================

    /// One directive; any transport failure or host drop faults the session.
    fn exchange(
        &self,
        session: &mut Session,
        command: &ScriptCommand,
        timeout: Duration,
    ) -> BridgeResult<ScriptReply> {
        let Some(emulator) = session.emulator.as_mut() else {
            return Err(BridgeError::not_connected("session has no emulator"));
        };
        match emulator.execute(command, timeout) {
            Ok(reply) if reply.status.is_connected() => Ok(reply),
            Ok(_) => {
                let err = BridgeError::faulted("host dropped the connection");
                self.fault(session, &err);
                Err(err)
            }
            Err(err) => {
                self.fault(session, &err);
                Err(err)
            }
        }
    }

    /// Like [`exchange`](Self::exchange), but an `error` reply is a protocol fault
    /// unless the keyboard is locked, which is reported as `E_LOCKED`.
    fn exchange_ok(
        &self,
        session: &mut Session,
        command: &ScriptCommand,
        timeout: Duration,
    ) -> BridgeResult<ScriptReply> {
        let reply = self.exchange(session, command, timeout)?;
        if reply.ok {
            return Ok(reply);
        }
        if reply.status.keyboard_locked() {
            session.state = SessionState::Locked;
            return Err(BridgeError::locked(format!(
                "{} rejected: keyboard locked",
                command.verb()
            )));
        }
        let err = BridgeError::protocol(
            format!("{} failed", command.verb()),
            serde_json::json!({"verb": command.verb(), "reply": reply.message()}),
        );
        self.fault(session, &err);
        Err(err)
    }

    fn capture_inner(
        &self,
        session: &mut Session,
        timeout: Duration,
        policy: LockPolicy,
    ) -> BridgeResult<Screen> {
        if policy == LockPolicy::RequireUnlocked {
            let unlock = ScriptCommand::Wait {
                secs: wait_secs(timeout),
                until: WaitFor::Unlock,
            };
            self.exchange(session, &unlock, timeout)?;
        }
        let reply = self.exchange(session, &ScriptCommand::ReadBuffer, timeout)?;
        if !reply.ok {
            let err = BridgeError::protocol(
                "buffer dump failed",
                serde_json::json!({"reply": reply.message()}),
            );
            self.fault(session, &err);
            return Err(err);
        }
        let screen = self.decoder.decode(
            &reply.data,
            Geometry {
                rows: reply.status.rows,
                cols: reply.status.cols,
                cursor: reply.status.cursor,
                keyboard_locked: reply.status.keyboard_locked(),
            },
        );
        session.state = if screen.keyboard_locked() {
            SessionState::Locked
        } else {
            SessionState::Ready
        };
        session.last_screen = Some(screen.clone());
        if policy == LockPolicy::RequireUnlocked && screen.keyboard_locked() {
            return Err(BridgeError::locked("keyboard still locked after waiting"));
        }
        Ok(screen)
    }

    /// Dump and decode the buffer.
    ///
    /// With [`LockPolicy::RequireUnlocked`] the emulator first blocks until the
    /// keyboard unlocks (bounded by `timeout`); a still-locked keyboard is `E_LOCKED`.
    pub fn capture_screen(
        &self,
        handle: &SessionHandle,
        timeout: Duration,
        policy: LockPolicy,
    ) -> BridgeResult<Screen> {
        let mut session = handle.lock()?;
        session.ensure_live()?;
        self.capture_inner(&mut session, timeout, policy)
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Dispatch an allowlisted action and re-capture the screen.
    ///
    /// Session-level faults come back as an [`ActionResult`] status; only
    /// validation and lifecycle errors are returned as `Err`.
    pub fn send_action(
        &self,
        handle: &SessionHandle,
        request: &ActionRequest,
    ) -> BridgeResult<ActionResult> {
        self.ensure_allowed(request.kind)?;
        let timeout = request
            .timeout_ms
            .map_or_else(|| self.config.timeouts.action(), Duration::from_millis);
        let mut session = handle.lock()?;
        session.ensure_live()?;
        if matches!(request.kind, ActionKind::Fill | ActionKind::FillByLabel | ActionKind::Press) {
            session.baseline_digest = session.last_screen.as_ref().map(Screen::content_digest);
        }
        let (label, outcome) = match request.kind {
            ActionKind::Fill | ActionKind::FillByLabel => {
                (request.kind.to_string(), self.fill_inner(&mut session, request, timeout))
            }
            ActionKind::Press => {
                let key = Key::parse(request.payload.as_deref().unwrap_or_default())?;
                (key.to_string(), self.press_inner(&mut session, key, timeout))
            }
            ActionKind::ReadScreen => (
                "read_screen".to_string(),
                self.capture_inner(&mut session, timeout, LockPolicy::RequireUnlocked),
            ),
            other => {
                return Err(BridgeError::validation(
                    format!("'{other}' is not a session action"),
                    serde_json::json!({"action": other}),
                ))
            }
        };
        let result = settle(&session, outcome);
        if let Ok(result) = &result {
            session.note_action(label, result.is_ok());
        }
        result
    }

    fn fill_inner(
        &self,
        session: &mut Session,
        request: &ActionRequest,
        timeout: Duration,
    ) -> BridgeResult<Screen> {
        let Some(ActionTarget::Position { row, col }) = request.target.clone() else {
            return Err(BridgeError::validation(
                "fill needs a row/col target",
                serde_json::json!({"target": request.target}),
            ));
        };
        if session.state == SessionState::Locked {
            return Err(BridgeError::locked("keyboard locked; input not accepted"));
        }
        let text = request.payload.clone().unwrap_or_default();
        self.exchange_ok(session, &ScriptCommand::MoveCursor { row, col }, timeout)?;
        self.exchange_ok(session, &ScriptCommand::EraseEof, timeout)?;
        self.exchange_ok(session, &ScriptCommand::String { text }, timeout)?;
        self.capture_inner(session, timeout, LockPolicy::AcceptLocked)
    }

    fn press_inner(&self, session: &mut Session, key: Key, timeout: Duration) -> BridgeResult<Screen> {
        let unlocking = matches!(key, Key::Reset | Key::Clear) || self.config.recovery.keys.contains(&key);
        if session.state == SessionState::Locked && !unlocking {
            return Err(BridgeError::locked(format!(
                "keyboard locked; {key} not accepted"
            )));
        }
        self.exchange_ok(session, &ScriptCommand::Key(key), timeout)?;
        if key.is_aid() {
            let unlock = ScriptCommand::Wait {
                secs: wait_secs(timeout),
                until: WaitFor::Unlock,
            };
            let reply = self.exchange(session, &unlock, timeout)?;
            if !reply.ok || reply.status.keyboard_locked() {
                self.capture_inner(session, timeout, LockPolicy::AcceptLocked)?;
                return Err(BridgeError::timeout(
                    format!("host did not unlock the keyboard after {key}"),
                    serde_json::json!({
                        "key": key,
                        "timeout_ms": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    }),
                ));
            }
        }
        self.capture_inner(session, timeout, LockPolicy::AcceptLocked)
    }

    /// Keyboard-lock recovery: try each configured key in order, at most
    /// `max_attempts` times, ending in `Ready` or `Faulted`.
    pub fn recover(&self, handle: &SessionHandle) -> BridgeResult<RecoveryReport> {
        self.ensure_allowed(ActionKind::Recover)?;
        let mut session = handle.lock()?;
        let policy = self.config.recovery.clone();
        let timeout = self.config.timeouts.capture();
        let mut keys = Vec::new();

        match session.state {
            SessionState::Ready => {
                return Ok(RecoveryReport {
                    final_state: SessionState::Ready,
                    attempts: 0,
                    keys,
                })
            }
            SessionState::Faulted => {
                return Ok(RecoveryReport {
                    final_state: SessionState::Faulted,
                    attempts: 0,
                    keys,
                })
            }
            SessionState::Locked => {}
            SessionState::Disconnected | SessionState::Connecting => session.ensure_live()?,
        }

        let mut attempts = 0;
        for attempt in 0..policy.max_attempts {
            let Some(key) = policy.key_for_attempt(usize::try_from(attempt).unwrap_or(usize::MAX))
            else {
                break;
            };
            attempts = attempt + 1;
            keys.push(key);
            tracing::warn!(session = %session.id, attempt = attempts, %key, "keyboard lock recovery");
            if self
                .exchange(&mut session, &ScriptCommand::Key(key), timeout)
                .is_err()
            {
                break;
            }
            let unlock = ScriptCommand::Wait {
                secs: wait_secs(timeout),
                until: WaitFor::Unlock,
            };
            if self.exchange(&mut session, &unlock, timeout).is_err() {
                break;
            }
            match self.capture_inner(&mut session, timeout, LockPolicy::AcceptLocked) {
                Ok(screen) if !screen.keyboard_locked() => {
                    session.note_action(format!("recover:{key}"), true);
                    return Ok(RecoveryReport {
                        final_state: SessionState::Ready,
                        attempts,
                        keys,
                    });
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        if session.state != SessionState::Faulted {
            let err = BridgeError::faulted("keyboard still locked after recovery");
            self.fault(&mut session, &err);
        }
        session.note_action("recover", false);
        Ok(RecoveryReport {
            final_state: SessionState::Faulted,
            attempts,
            keys,
        })
    }

    /// Block until `condition` holds or `timeout` passes, never by sleeping:
    /// each round blocks inside the emulator on an unlock/output signal.
    pub fn wait_for(
        &self,
        handle: &SessionHandle,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> BridgeResult<ActionResult> {
        self.ensure_allowed(ActionKind::Wait)?;
        let mut session = handle.lock()?;
        session.ensure_live()?;
        let outcome = self.wait_inner(&mut session, condition, timeout);
        let result = settle(&session, outcome);
        if let Ok(result) = &result {
            session.note_action(format!("wait:{condition}"), result.is_ok());
        }
        result
    }

    fn wait_inner(
        &self,
        session: &mut Session,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> BridgeResult<Screen> {
        let deadline = Instant::now() + timeout;
        if *condition == WaitCondition::Ready {
            let ready = ScriptCommand::Wait {
                secs: wait_secs(timeout),
                until: WaitFor::InputField,
            };
            let reply = self.exchange(session, &ready, timeout)?;
            let screen = self.capture_inner(session, timeout, LockPolicy::AcceptLocked)?;
            if reply.ok && !screen.keyboard_locked() {
                return Ok(screen);
            }
            return Err(wait_timeout(condition, timeout));
        }

        // A change is measured against the screen before the last fill or key,
        // so a wait issued after the action still sees the host's response.
        let baseline = match condition {
            WaitCondition::ScreenChanged => match session.baseline_digest.take() {
                Some(digest) => Some(digest),
                None => match session.last_screen.as_ref() {
                    Some(screen) => Some(screen.content_digest()),
                    None => Some(
                        self.capture_inner(session, timeout, LockPolicy::AcceptLocked)?
                            .content_digest(),
                    ),
                },
            },
            _ => None,
        };
        loop {
            let screen = self.capture_inner(session, timeout, LockPolicy::AcceptLocked)?;
            if condition_met(condition, &screen, baseline.as_deref()) {
                return Ok(screen);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(wait_timeout(condition, timeout));
            }
            let output = ScriptCommand::Wait {
                secs: wait_secs(remaining),
                until: WaitFor::Output,
            };
            let reply = self.exchange(session, &output, remaining)?;
            if !reply.ok {
                // No further host output arrived; evaluate one last time.
                let screen = self.capture_inner(session, timeout, LockPolicy::AcceptLocked)?;
                if condition_met(condition, &screen, baseline.as_deref()) {
                    return Ok(screen);
                }
                return Err(wait_timeout(condition, timeout));
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

fn condition_met(condition: &WaitCondition, screen: &Screen, baseline: Option<&str>) -> bool {
    match condition {
        WaitCondition::Text { text } => screen.contains(text),
        WaitCondition::TextAbsent { text } => !screen.contains(text),
        WaitCondition::ScreenChanged => baseline != Some(screen.content_digest().as_str()),
        WaitCondition::Ready => !screen.keyboard_locked(),
    }
}

fn wait_timeout(condition: &WaitCondition, timeout: Duration) -> BridgeError {
    BridgeError::timeout(
        format!("condition {condition} not met"),
        serde_json::json!({
            "condition": condition,
            "timeout_ms": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    )
}

/// Emulator-side wait granularity is whole seconds; never below one.
fn wait_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

/// Map a session-level outcome to an [`ActionResult`], keeping lifecycle and
/// validation errors as `Err`.
fn settle(session: &Session, outcome: BridgeResult<Screen>) -> BridgeResult<ActionResult> {
    let err = match outcome {
        Ok(screen) => return Ok(ActionResult::ok(screen)),
        Err(err) => err,
    };
    let status = match err.code {
        ErrorCode::Locked => ActionStatus::Locked,
        ErrorCode::Timeout => ActionStatus::Timeout,
        ErrorCode::NotFound => ActionStatus::NotFound,
        ErrorCode::Protocol | ErrorCode::SessionFaulted => ActionStatus::ProtocolError,
        _ => return Err(err),
    };
    Ok(ActionResult::failed(
        status,
        session.last_screen.clone(),
        &err,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_granularity_rounds_up() {
        assert_eq!(wait_secs(Duration::from_millis(1)), 1);
        assert_eq!(wait_secs(Duration::from_millis(1500)), 2);
        assert_eq!(wait_secs(Duration::from_secs(3)), 3);
        assert_eq!(wait_secs(Duration::ZERO), 1);
    }
}
