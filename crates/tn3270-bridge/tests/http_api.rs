// Test module - relaxed lint rules
#![allow(clippy::indexing_slicing)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

//! HTTP control surface tests
//!
//! Drives the router in-process with `tower::ServiceExt::oneshot`; the
//! sessions behind it talk to the fake host.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::Harness;
use serde_json::{json, Value};
use std::sync::Arc;
use tn3270_bridge::golden::GoldenRegistry;
use tn3270_bridge::server::{router, AppState};
use tn3270_bridge_fixtures::HostBehavior;
use tower::ServiceExt;

struct Api {
    harness: Harness,
    state: Arc<AppState>,
}

impl Api {
    fn new(behavior: HostBehavior) -> Self {
        let harness = Harness::new(behavior);
        let state = Arc::new(AppState::from_parts(
            Arc::clone(&harness.executor),
            Arc::new(GoldenRegistry::new()),
        ));
        Self { harness, state }
    }

    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router(Arc::clone(&self.state))
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.call("GET", uri, None).await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.call("POST", uri, Some(body)).await
    }
}

// =============================================================================
// Health and session lifecycle
// =============================================================================

#[tokio::test]
async fn healthz_tracks_the_primary_session() {
    let api = Api::new(HostBehavior::default());

    let (status, body) = api.get("/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["connected"], false);

    let (status, body) = api.post("/connect", json!({})).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["state"], "ready");
    assert_eq!(body["host"], "127.0.0.1:3270");

    let (status, body) = api.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connected"], true);
}

#[tokio::test]
async fn connect_without_body_uses_default_host() {
    let api = Api::new(HostBehavior::default());
    let (status, body) = api.call("POST", "/connect", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(api.harness.launcher.launches(), 1);
}

#[tokio::test]
async fn disallowed_host_is_rejected_before_launch() {
    let api = Api::new(HostBehavior::default());
    let (status, body) = api
        .post("/connect", json!({"host": "mainframe.example.com:23"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "E_VALIDATION");
    assert_eq!(api.harness.launcher.launches(), 0);
}

#[tokio::test]
async fn unreachable_host_is_bad_gateway() {
    let api = Api::new(HostBehavior::unreachable());
    let (status, body) = api.post("/connect", json!({})).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "E_CONNECT");
}

#[tokio::test]
async fn reconnect_replaces_primary_session() {
    let api = Api::new(HostBehavior::default());
    let (_, first) = api.post("/connect", json!({})).await;
    let (_, second) = api.post("/connect", json!({})).await;
    assert_ne!(first["id"], second["id"]);

    let (status, body) = api.get("/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["primary"]["id"], second["id"]);
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_connects_leave_one_session() {
    let api = Api::new(HostBehavior::default());
    let ((first, _), (second, _)) = tokio::join!(
        api.post("/connect", json!({})),
        api.post("/connect", json!({}))
    );
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);

    let sessions = api.harness.manager().sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    let (_, body) = api.get("/status").await;
    assert_eq!(body["primary"]["id"], json!(sessions[0].id));
}

#[tokio::test]
async fn actions_without_session_conflict() {
    let api = Api::new(HostBehavior::default());
    let (status, body) = api.get("/screen").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "E_NOT_CONNECTED");

    let (status, _) = api.post("/press", json!({"key": "Enter"})).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn disconnect_clears_primary() {
    let api = Api::new(HostBehavior::default());
    api.post("/connect", json!({})).await;
    let (status, body) = api.call("POST", "/disconnect", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, _) = api.call("POST", "/disconnect", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = api.get("/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

// =============================================================================
// Screen actions
// =============================================================================

#[tokio::test]
async fn logon_over_http() {
    let api = Api::new(HostBehavior::default());
    api.post("/connect", json!({})).await;

    let (status, screen) = api.get("/screen").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(screen["cursor"], json!({"row": 0, "col": 12}));
    assert!(screen["lines"][0].as_str().unwrap().contains("Logon ===>"));

    let (status, body) = api
        .post(
            "/fill_by_label",
            json!({"label": "Logon ===>", "value": "HERC02", "offset": 1}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "ok");

    let (status, body) = api.post("/press", json!({"key": "enter"})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["screen_after"]["lines"][23]
        .as_str()
        .unwrap()
        .contains("ENTER PASSWORD"));

    let (status, body) = api
        .post("/fill", json!({"row": 0, "col": 15, "text": "CUL8TR"}))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(!body.to_string().contains("CUL8TR"));

    api.post("/press", json!({"key": "Enter"})).await;
    let (status, body) = api
        .post("/wait", json!({"condition": "text", "text": "READY HERC02"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn bad_input_is_a_validation_error() {
    let api = Api::new(HostBehavior::default());
    api.post("/connect", json!({})).await;

    let (status, body) = api.post("/press", json!({"key": "PF99"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "E_VALIDATION");

    let (status, body) = api
        .post("/fill", json!({"row": 0, "col": 1, "text": "X"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert_eq!(body["code"], "E_VALIDATION");
}

#[tokio::test]
async fn missing_label_is_reported_in_result() {
    let api = Api::new(HostBehavior::default());
    api.post("/connect", json!({})).await;

    let (status, body) = api
        .post("/fill_by_label", json!({"label": "Nope ===>", "value": "X"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "not_found");
}

#[tokio::test]
async fn recover_releases_a_locked_keyboard() {
    let api = Api::new(HostBehavior::default());
    api.post("/connect", json!({})).await;
    api.harness.host().behavior_mut().lock_on_enter = 1;

    let (status, body) = api.post("/press", json!({"key": "Enter"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "timeout");

    let (status, body) = api.call("POST", "/recover", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["final_state"], "ready");
    assert_eq!(body["keys"], json!(["Reset", "Clear"]));
}

#[tokio::test]
async fn reset_session_reconnects() {
    let api = Api::new(HostBehavior::default());
    let (_, connected) = api.post("/connect", json!({})).await;
    let (status, body) = api.call("POST", "/reset_session", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["id"], connected["id"]);
    assert_eq!(body["state"], "ready");
    assert_eq!(api.harness.launcher.launches(), 2);
}

// =============================================================================
// Goldens
// =============================================================================

#[tokio::test]
async fn golden_save_and_compare() {
    let api = Api::new(HostBehavior::default());
    api.post("/connect", json!({})).await;

    let (status, body) = api.call("POST", "/golden/logon", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["name"], "logon");

    let (status, body) = api.get("/golden/logon").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "match");

    api.post("/fill_by_label", json!({"label": "Logon ===>", "value": "HERC02", "offset": 1}))
        .await;
    api.post("/press", json!({"key": "Enter"})).await;
    let (_, body) = api.get("/golden/logon").await;
    assert_eq!(body["result"], "mismatch");
    assert!(!body["diffs"].as_array().unwrap().is_empty());

    let (status, body) = api.get("/golden/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "E_GOLDEN");
}
