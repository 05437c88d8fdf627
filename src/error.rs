//! Core error taxonomy for the session runtime.

use thiserror::Error;

/// Result type used throughout the core (non-HTTP) layers.
pub type CesResult<T> = Result<T, CesError>;

/// Errors surfaced by the session runtime.
///
/// The HTTP layer (`crate::api::error::ApiError`) wraps this type and maps
/// each variant to a status code; nothing below this layer knows about HTTP.
#[derive(Debug, Error)]
pub enum CesError {
    /// No session exists with the given id.
    #[error("session not found: {0}")]
    NotFound(String),

    /// No artifact exists with the given name in the session's cwd.
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    /// A session with this id already exists.
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    /// The `exec_id` has already been used in this session.
    #[error("execution id already used: {0}")]
    DuplicateExecution(String),

    /// The interpreter did not become ready within the startup deadline.
    #[error("interpreter failed to start: {0}")]
    StartupFailed(String),

    /// The interpreter process is gone (crashed, was killed, or its output
    /// channel closed unexpectedly).
    #[error("interpreter process is gone: {0}")]
    PeerGone(String),

    /// An operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Missing or invalid API key.
    #[error("unauthorized")]
    Unauthorized,

    /// Malformed input from the caller; never reaches the interpreter.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The session has already been stopped.
    #[error("session stopped: {0}")]
    SessionStopped(String),

    /// An invariant was violated. Should be unreachable; indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CesError {
    /// A short machine-readable code for this error, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            CesError::NotFound(_) => "not_found",
            CesError::ArtifactNotFound(_) => "artifact_not_found",
            CesError::AlreadyExists(_) => "already_exists",
            CesError::DuplicateExecution(_) => "duplicate_execution",
            CesError::StartupFailed(_) => "startup_failed",
            CesError::PeerGone(_) => "peer_gone",
            CesError::Timeout(_) => "timeout",
            CesError::Unauthorized => "unauthorized",
            CesError::BadRequest(_) => "bad_request",
            CesError::SessionStopped(_) => "session_stopped",
            CesError::Internal(_) => "internal",
        }
    }
}
