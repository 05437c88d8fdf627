//! HTTP handlers for the `/api/v1` surface.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine as _;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::error::CesError;
use crate::session::SessionInfo;
use crate::stream_hub::OutputEvent;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_sessions: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: state.manager.session_count(),
    })
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.manager.list().await)
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.manager.create(req.session_id).await?;
    Ok((StatusCode::CREATED, Json(session.info().await)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = state.manager.get(&session_id)?;
    Ok(Json(session.info().await))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.delete(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct LoadExtensionRequest {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

pub async fn load_extension(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<LoadExtensionRequest>,
) -> Result<StatusCode, ApiError> {
    let session = state.manager.get(&session_id)?;
    session.load_extension(req.name, req.source, req.config).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub exec_id: String,
    pub code: String,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ExecuteResponse {
    Streaming { exec_id: String, stream_url: String },
    Finished(crate::engine::ExecutionResult),
}

pub async fn execute(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.manager.get(&session_id)?;

    if req.stream {
        let (_hub, _done) = session
            .begin_execute(req.exec_id.clone(), req.code, state.config.execution_timeout)
            .await?;
        let stream_url = format!(
            "/api/v1/sessions/{session_id}/execute/{}/stream",
            req.exec_id
        );
        Ok((
            StatusCode::ACCEPTED,
            Json(ExecuteResponse::Streaming {
                exec_id: req.exec_id,
                stream_url,
            }),
        ))
    } else {
        let result = session
            .execute(req.exec_id, req.code, state.config.execution_timeout)
            .await?;
        Ok((StatusCode::OK, Json(ExecuteResponse::Finished(result))))
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateVariablesRequest {
    pub bindings: HashMap<String, String>,
}

pub async fn update_variables(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<UpdateVariablesRequest>,
) -> Result<StatusCode, ApiError> {
    let session = state.manager.get(&session_id)?;
    session.update_variables(req.bindings).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// SSE stream for one execution. Replays from sequence 0 on every
/// subscription (including reconnects), satisfying the late-join guarantee.
pub async fn stream_execution(
    State(state): State<AppState>,
    Path((session_id, exec_id)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError> {
    let session = state.manager.get(&session_id)?;
    let hub = session
        .hub_for(&exec_id)
        .await
        .ok_or_else(|| CesError::NotFound(format!("execution not found: {exec_id}")))?;

    let stream = async_stream::stream! {
        let mut sub = hub.subscribe();
        while let Some(event) = sub.rx.recv().await {
            let terminal = event.terminal_flag;
            yield Ok(sse_event(&event));
            if terminal {
                yield Ok(Event::default().event("done").data("{}"));
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &OutputEvent) -> Event {
    let name = match event.kind {
        crate::stream_hub::OutputKind::Result => "result",
        _ => "output",
    };
    let data = serde_json::json!({
        "seq": event.sequence_no,
        "kind": event.kind,
        "payload": event.payload,
        "terminal": event.terminal_flag,
    });
    Event::default().event(name).json_data(data).unwrap_or_else(|_| Event::default())
}

#[derive(Debug, Deserialize)]
pub struct UploadFileRequest {
    pub filename: String,
    pub content_base64: String,
}

/// Reject any filename containing a path separator or `..`, per the
/// artifact-serving contract; this is a stricter, single-purpose cousin of
/// `fileserver::handlers::sanitize_filename` (we refuse rather than rewrite).
fn validate_filename(name: &str) -> Result<(), ApiError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.split('/').any(|part| part == "..")
        || name == ".."
    {
        return Err(ApiError::from(CesError::BadRequest(format!(
            "invalid filename: {name}"
        ))));
    }
    Ok(())
}

pub async fn upload_file(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<UploadFileRequest>,
) -> Result<StatusCode, ApiError> {
    validate_filename(&req.filename)?;
    let session = state.manager.get(&session_id)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&req.content_base64)
        .map_err(|e| CesError::BadRequest(format!("invalid base64 content: {e}")))?;
    tokio::fs::write(session.cwd.join(&req.filename), bytes)
        .await
        .map_err(|e| CesError::Internal(format!("failed to write uploaded file: {e}")))?;
    Ok(StatusCode::CREATED)
}

pub async fn download_artifact(
    State(state): State<AppState>,
    Path((session_id, file_name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    validate_filename(&file_name)?;
    let session = state.manager.get(&session_id)?;
    let path = session.cwd.join(&file_name);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| CesError::ArtifactNotFound(file_name.clone()))?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime.essence_str().to_string())],
        bytes,
    )
        .into_response())
}
