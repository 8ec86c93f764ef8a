//! HTTP control surface.
//!
//! Every handler hands its work to a blocking worker so the synchronous
//! session contract is kept; the router itself never touches the emulator.
//! Requests address a single primary session opened by `/connect`.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult, ErrorCode};
use crate::executor::ActionExecutor;
use crate::golden::{Comparison, GoldenEntry, GoldenRegistry};
use crate::model::{ActionResult, HealthReport, Screen, SessionStatus, WaitCondition};
use crate::session::{LockPolicy, RecoveryReport, SessionHandle, SessionManager};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared state behind the router.
pub struct AppState {
    executor: Arc<ActionExecutor>,
    goldens: Arc<GoldenRegistry>,
    primary: Mutex<Option<SessionHandle>>,
}

impl AppState {
    /// State for a validated config, launching the configured emulator.
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        config.validate()?;
        let goldens = match &config.goldens_dir {
            Some(dir) => GoldenRegistry::open(dir)?,
            None => GoldenRegistry::new(),
        };
        let executor = ActionExecutor::new(Arc::new(SessionManager::new(config)));
        Ok(Self::from_parts(Arc::new(executor), Arc::new(goldens)))
    }

    #[must_use]
    pub fn from_parts(executor: Arc<ActionExecutor>, goldens: Arc<GoldenRegistry>) -> Self {
        Self {
            executor,
            goldens,
            primary: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    fn slot(&self) -> BridgeResult<std::sync::MutexGuard<'_, Option<SessionHandle>>> {
        self.primary
            .lock()
            .map_err(|_| BridgeError::internal("primary session lock poisoned"))
    }

    fn primary(&self) -> BridgeResult<SessionHandle> {
        self.slot()?
            .clone()
            .ok_or_else(|| BridgeError::not_connected("no session; POST /connect first"))
    }

    fn capture_timeout(&self) -> Duration {
        self.executor.manager().config().timeouts.capture()
    }
}

/// Error body and status for a [`BridgeError`].
pub struct ApiError(pub BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (status_for(self.0.code), Json(self.0.to_error_info())).into_response()
    }
}

#[must_use]
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound | ErrorCode::Golden => StatusCode::NOT_FOUND,
        ErrorCode::NotConnected | ErrorCode::SessionFaulted | ErrorCode::Canceled => {
            StatusCode::CONFLICT
        }
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Connect => StatusCode::BAD_GATEWAY,
        ErrorCode::Locked => StatusCode::LOCKED,
        ErrorCode::Assertion | ErrorCode::ReplayMismatch => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Io | ErrorCode::Internal | ErrorCode::Protocol => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn blocking<T, F>(state: &Arc<AppState>, work: F) -> ApiResult<T>
where
    F: FnOnce(&AppState) -> BridgeResult<T> + Send + 'static,
    T: Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || work(&state))
        .await
        .map_err(|err| ApiError(BridgeError::internal(format!("worker failed: {err}"))))?
        .map(Json)
        .map_err(ApiError)
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    pub host: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct FillRequest {
    pub row: u16,
    pub col: u16,
    pub text: String,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct FillByLabelRequest {
    pub label: String,
    pub value: String,
    #[serde(default)]
    pub offset: usize,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PressRequest {
    pub key: String,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct WaitRequest {
    #[serde(flatten)]
    pub condition: WaitCondition,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub primary: Option<SessionStatus>,
    pub sessions: Vec<SessionStatus>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/reset_session", post(reset_session))
        .route("/screen", get(screen))
        .route("/fill", post(fill))
        .route("/fill_by_label", post(fill_by_label))
        .route("/press", post(press))
        .route("/wait", post(wait))
        .route("/recover", post(recover))
        .route("/status", get(status))
        .route("/golden/:name", post(save_golden).get(compare_golden))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve on the configured loopback address until `shutdown` resolves, then
/// disconnect every session.
pub async fn serve<S>(state: Arc<AppState>, shutdown: S) -> BridgeResult<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let listen = state.executor.manager().config().listen.clone();
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|err| BridgeError::io(format!("failed to bind {listen}"), err))?;
    tracing::info!(%listen, "control surface listening");
    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| BridgeError::io("server failed", err))?;
    let manager = Arc::clone(state.executor.manager());
    tokio::task::spawn_blocking(move || manager.disconnect_all())
        .await
        .map_err(|err| BridgeError::internal(format!("shutdown worker failed: {err}")))?;
    tracing::info!("control surface stopped");
    Ok(())
}

fn millis(timeout_ms: Option<u64>) -> Option<Duration> {
    timeout_ms.map(Duration::from_millis)
}

async fn connect(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ConnectRequest>>,
) -> ApiResult<SessionStatus> {
    let Json(request) = body.unwrap_or_default();
    blocking(&state, move |state| {
        let previous = state.slot()?.take();
        if let Some(previous) = previous {
            if let Err(err) = state.executor.disconnect(&previous) {
                tracing::warn!(error = %err, "failed to close previous session");
            }
        }
        let handle = state
            .executor
            .connect(request.host.as_deref(), millis(request.timeout_ms))?;
        let status = state.executor.manager().status(&handle)?;
        // A concurrent connect may have filled the slot meanwhile; only one survives.
        let displaced = state.slot()?.replace(handle);
        if let Some(displaced) = displaced {
            if let Err(err) = state.executor.disconnect(&displaced) {
                tracing::warn!(error = %err, "failed to close displaced session");
            }
        }
        Ok(status)
    })
    .await
}

async fn disconnect(State(state): State<Arc<AppState>>) -> ApiResult<Ack> {
    blocking(&state, |state| {
        let handle = state.primary()?;
        *state.slot()? = None;
        state.executor.disconnect(&handle)?;
        Ok(Ack { ok: true })
    })
    .await
}

async fn reset_session(State(state): State<Arc<AppState>>) -> ApiResult<SessionStatus> {
    blocking(&state, |state| {
        let handle = state.primary()?;
        state.executor.reset(&handle, None)
    })
    .await
}

async fn screen(State(state): State<Arc<AppState>>) -> ApiResult<Screen> {
    blocking(&state, |state| {
        let handle = state.primary()?;
        state
            .executor
            .manager()
            .capture_screen(&handle, state.capture_timeout(), LockPolicy::AcceptLocked)
    })
    .await
}

async fn fill(State(state): State<Arc<AppState>>, Json(request): Json<FillRequest>) -> ApiResult<ActionResult> {
    blocking(&state, move |state| {
        let handle = state.primary()?;
        state.executor.fill_at(
            &handle,
            request.row,
            request.col,
            &request.text,
            millis(request.timeout_ms),
        )
    })
    .await
}

async fn fill_by_label(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FillByLabelRequest>,
) -> ApiResult<ActionResult> {
    blocking(&state, move |state| {
        let handle = state.primary()?;
        state.executor.fill_by_label(
            &handle,
            &request.label,
            &request.value,
            request.offset,
            millis(request.timeout_ms),
        )
    })
    .await
}

async fn press(State(state): State<Arc<AppState>>, Json(request): Json<PressRequest>) -> ApiResult<ActionResult> {
    blocking(&state, move |state| {
        let handle = state.primary()?;
        state
            .executor
            .press(&handle, &request.key, millis(request.timeout_ms))
    })
    .await
}

async fn wait(State(state): State<Arc<AppState>>, Json(request): Json<WaitRequest>) -> ApiResult<ActionResult> {
    blocking(&state, move |state| {
        let handle = state.primary()?;
        state
            .executor
            .wait(&handle, &request.condition, millis(request.timeout_ms))
    })
    .await
}

async fn recover(State(state): State<Arc<AppState>>) -> ApiResult<RecoveryReport> {
    blocking(&state, |state| {
        let handle = state.primary()?;
        state.executor.recover(&handle)
    })
    .await
}

async fn status(State(state): State<Arc<AppState>>) -> ApiResult<StatusReport> {
    blocking(&state, |state| {
        let primary = state.slot()?.clone();
        let manager = state.executor.manager();
        Ok(StatusReport {
            primary: primary.map(|handle| manager.status(&handle)).transpose()?,
            sessions: manager.sessions()?,
        })
    })
    .await
}

async fn save_golden(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult<GoldenEntry> {
    blocking(&state, move |state| {
        let handle = state.primary()?;
        let screen = state.executor.manager().capture_screen(
            &handle,
            state.capture_timeout(),
            LockPolicy::RequireUnlocked,
        )?;
        state.goldens.save(&name, &screen)
    })
    .await
}

async fn compare_golden(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult<Comparison> {
    blocking(&state, move |state| {
        let handle = state.primary()?;
        let screen = state.executor.manager().capture_screen(
            &handle,
            state.capture_timeout(),
            LockPolicy::AcceptLocked,
        )?;
        state.goldens.compare(&name, &screen)
    })
    .await
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<(StatusCode, Json<HealthReport>), ApiError> {
    let Json(report) = blocking(&state, |state| {
        let primary = state.slot()?.clone();
        Ok(state.executor.health(primary.as_ref()))
    })
    .await?;
    let code = if report.connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((code, Json(report)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_statuses() {
        assert_eq!(status_for(ErrorCode::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::NotConnected), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorCode::Locked), StatusCode::LOCKED);
        assert_eq!(status_for(ErrorCode::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorCode::Connect), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn wait_request_flattens_condition() {
        let request: Result<WaitRequest, _> =
            serde_json::from_str(r#"{"condition":"text","text":"READY","timeout_ms":500}"#);
        let request = request.ok();
        assert_eq!(
            request.as_ref().map(|r| &r.condition),
            Some(&WaitCondition::Text {
                text: "READY".to_string()
            })
        );
        assert_eq!(request.and_then(|r| r.timeout_ms), Some(500));
    }
}
