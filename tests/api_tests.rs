//! API integration tests, driven against an in-process router with no real
//! interpreter: `fake_interpreter.sh` stands in for the adapter.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use ces::api::routes::build_router;
use ces::api::state::AppState;
use ces::config::Config;
use ces::manager::{ManagerConfig, SessionManager};
use serde_json::{json, Value};
use tower::ServiceExt;

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("fake_interpreter.sh")
}

async fn test_app() -> (axum::Router, tempfile::TempDir) {
    let workspace = tempfile::tempdir().unwrap();
    let manager_config = ManagerConfig {
        workspace_root: workspace.path().to_path_buf(),
        interpreter_command: "sh".to_string(),
        interpreter_args: vec![fixture_path().to_string_lossy().to_string()],
        startup_timeout: Duration::from_secs(5),
        idle_timeout: None,
        sweep_interval: Duration::from_secs(60),
    };
    let manager = SessionManager::new(manager_config);
    let config = Config {
        bind: "127.0.0.1".to_string(),
        port: 0,
        workspace_root: workspace.path().to_path_buf(),
        api_key: None,
        interpreter_command: "sh".to_string(),
        interpreter_args: vec![],
        startup_timeout: Duration::from_secs(5),
        execution_timeout: Duration::from_secs(5),
        idle_timeout: None,
        sweep_interval: Duration::from_secs(60),
    };
    let state = AppState {
        manager,
        config: Arc::new(config),
    };
    (build_router(state), workspace)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_zero_sessions_initially() {
    let (app, _workspace) = test_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["active_sessions"], 0);
}

#[tokio::test]
async fn create_execute_and_recall_state_across_executions() {
    let (app, _workspace) = test_app().await;

    let create = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions")
                .method(Method::POST)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "session_id": "s1" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::CREATED);

    let exec1 = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions/s1/execute")
                .method(Method::POST)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "exec_id": "e1", "code": "x = 41" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(exec1.status(), StatusCode::OK);
    let result = body_json(exec1).await;
    assert_eq!(result["success"], true);
    assert_eq!(result["surfaced_variables"][0]["name"], "x");

    let duplicate = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions/s1/execute")
                .method(Method::POST)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "exec_id": "e1", "code": "x = 99" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn unknown_session_returns_not_found() {
    let (app, _workspace) = test_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions/does-not-exist")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_then_download_artifact_round_trips_content() {
    let (app, _workspace) = test_app().await;

    app.clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions")
                .method(Method::POST)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "session_id": "s2" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let content = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"hello");
    let upload = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions/s2/files")
                .method(Method::POST)
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "filename": "a.txt", "content_base64": content }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(upload.status(), StatusCode::CREATED);

    let download = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions/s2/artifacts/a.txt")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(download.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(download.into_body(), 1024).await.unwrap();
    assert_eq!(&bytes[..], b"hello");
}

#[tokio::test]
async fn streaming_execute_exposes_a_working_sse_endpoint() {
    let (app, _workspace) = test_app().await;

    app.clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions")
                .method(Method::POST)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "session_id": "s4" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let accepted = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions/s4/execute")
                .method(Method::POST)
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "exec_id": "e4", "code": "y = 1", "stream": true }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    let accepted_body = body_json(accepted).await;
    assert_eq!(accepted_body["exec_id"], "e4");
    assert_eq!(
        accepted_body["stream_url"],
        "/api/v1/sessions/s4/execute/e4/stream"
    );

    let stream_response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions/s4/execute/e4/stream")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(stream_response.status(), StatusCode::OK);
    assert_eq!(
        stream_response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let body = axum::body::to_bytes(stream_response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("event: result"), "body was: {text}");
    assert!(text.contains("event: done"), "body was: {text}");
}

#[tokio::test]
async fn load_extension_succeeds_and_surfaces_in_session_state() {
    let (app, _workspace) = test_app().await;
    app.clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions")
                .method(Method::POST)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "session_id": "s5" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions/s5/plugins")
                .method(Method::POST)
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "name": "helper", "source": "def f(): pass" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn load_extension_failure_is_a_client_error_not_a_gateway_error() {
    let (app, _workspace) = test_app().await;
    app.clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions")
                .method(Method::POST)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "session_id": "s6" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions/s6/plugins")
                .method(Method::POST)
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "name": "fail_me", "source": "raise RuntimeError()" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_session_removes_it_from_the_listing() {
    let (app, _workspace) = test_app().await;
    app.clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions")
                .method(Method::POST)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "session_id": "s7" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let listed = body_json(
        app.clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/sessions")
                    .method(Method::GET)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap(),
    )
    .await;
    assert!(listed.as_array().unwrap().iter().any(|s| s["id"] == "s7"));

    let delete = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions/s7")
                .method(Method::DELETE)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(delete.status(), StatusCode::NO_CONTENT);

    let listed_after = body_json(
        app.clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/sessions")
                    .method(Method::GET)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap(),
    )
    .await;
    assert!(!listed_after.as_array().unwrap().iter().any(|s| s["id"] == "s7"));

    let get_after = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions/s7")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get_after.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn artifact_download_rejects_path_traversal() {
    let (app, _workspace) = test_app().await;
    app.clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions")
                .method(Method::POST)
                .header("content-type", "application/json")
                .body(Body::from(json!({ "session_id": "s3" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions/s3/artifacts/..%2F..%2Fetc%2Fpasswd")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
