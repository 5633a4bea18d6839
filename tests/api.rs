use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tempfile::TempDir;
use tower::ServiceExt;

use llmshell::shell::logstore::LogStore;
use llmshell::shell::probe::ProcfsProbe;
use llmshell::shell::server::{build_router, AppState};
use llmshell::shell::supervisor::Supervisor;

fn test_app(tmp: &TempDir) -> Router {
    let store = Arc::new(LogStore::new(tmp.path()));
    let supervisor = Arc::new(Supervisor::new(Arc::clone(&store)));
    build_router(AppState {
        supervisor,
        log_store: store,
        probe: Arc::new(ProcfsProbe),
        restart_timeout_secs: 10,
    })
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn health_returns_constant_payload() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value, serde_json::json!({ "status": "healthy" }));
}

#[tokio::test]
async fn start_rejects_empty_and_blank_commands() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);

    let (status, body) = send(&app, post("/start", "")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.starts_with("error:"), "unexpected body: {body}");

    let (status, _) = send(&app, post("/start", "   \n")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, post_json("/start", r#"{"command":"   "}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_before_any_start_is_404() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);

    let (status, body) = send(&app, get("/status")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.starts_with("error:"));

    let (status, body) = send(&app, get("/status?format=json")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert!(value["error"].is_string());
}

#[tokio::test]
async fn kill_rejects_unknown_signal_type() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);
    let (status, body) = send(&app, post("/kill?type=SIGFOO", "")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("SIGFOO"));
}

#[tokio::test]
async fn restart_rejects_bad_timeouts() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);
    for uri in ["/restart?timeout=-1", "/restart?timeout=soon"] {
        let (status, _) = send(&app, post(uri, "")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn logs_with_both_filters_is_400() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);
    let (status, _) = send(&app, get("/logs?lines=5&seconds=5")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn logs_before_any_start_is_404() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);
    let (status, _) = send(&app, get("/logs")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn fast_exit_workflow() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);

    let (status, body) = send(&app, post("/start", "echo hello")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("status: exited"), "unexpected body: {body}");
    assert!(body.contains("exit_code: 0"));
    // The settle window already observed the exit, so the captured output is
    // part of the synchronous response.
    assert!(body.contains("hello"));

    let (status, body) = send(&app, get("/logs?lines=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("hello"));

    let (status, body) = send(&app, get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("status: exited"));
}

#[tokio::test]
async fn long_run_kill_workflow() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);

    let (status, body) = send(&app, post_json("/start", r#"{"command":"sleep 30"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("status: running"));
    assert!(body.contains("pid: "));

    let (status, body) = send(&app, post("/kill?type=SIGTERM", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("status: killed"));
    assert!(body.contains("type: SIGTERM"));
    assert!(body.contains("stopped_at: "));

    let (status, body) = send(&app, get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("status: killed"));
    assert!(body.contains("kill_type: SIGTERM"));
}

#[tokio::test]
async fn double_start_conflicts() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);

    let (status, _) = send(&app, post("/start", "sleep 30")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, post("/start", "echo x")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body.starts_with("error:"));

    let (status, body) = send(&app, post("/kill?type=SIGKILL", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("type: SIGKILL"));
}

#[tokio::test]
async fn restart_keeps_the_command_with_new_identity() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);

    let (status, body) = send(
        &app,
        post("/start?format=json", "while true; do echo tick; sleep 1; done"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let first: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(first["status"], "running");
    let first_pid = first["pid"].as_u64().unwrap();
    let first_log = first["log_file"].as_str().unwrap().to_string();

    let (status, body) = send(&app, post("/restart?timeout=1&format=json", "")).await;
    assert_eq!(status, StatusCode::OK);
    let second: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(second["status"], "running");
    assert_eq!(second["command"], "while true; do echo tick; sleep 1; done");
    assert_ne!(second["pid"].as_u64().unwrap(), first_pid);
    assert_ne!(second["log_file"].as_str().unwrap(), first_log);

    // The read path follows the new run's file.
    let (status, body) = send(&app, get("/logs?lines=3")).await;
    assert_eq!(status, StatusCode::OK);
    for line in body.lines() {
        assert_eq!(line, "tick");
    }

    let (status, _) = send(&app, post("/kill?type=SIGKILL", "")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn logs_seconds_filter_returns_recent_lines() {
    let tmp = TempDir::new().unwrap();
    let app = test_app(&tmp);

    let (status, _) = send(&app, post("/start", "echo fresh; sleep 30")).await;
    assert_eq!(status, StatusCode::OK);

    // The record is seconds old at most; a generous window must include it.
    let (status, body) = send(&app, get("/logs?seconds=60")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("fresh"));

    let (status, _) = send(&app, post("/kill?type=SIGKILL", "")).await;
    assert_eq!(status, StatusCode::OK);
}
