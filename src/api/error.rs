//! HTTP-facing error wrapper.
//!
//! Directly grounded on `octo::auth::error::AuthError`/`AuthErrorResponse`:
//! one `{error, error_code}` JSON body, one status code per variant.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::error::CesError;

#[derive(Debug)]
pub struct ApiError(CesError);

impl From<CesError> for ApiError {
    fn from(err: CesError) -> Self {
        ApiError(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    error_code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CesError::NotFound(_) | CesError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            CesError::AlreadyExists(_) | CesError::DuplicateExecution(_) => StatusCode::CONFLICT,
            CesError::StartupFailed(_) => StatusCode::BAD_GATEWAY,
            CesError::PeerGone(_) => StatusCode::BAD_GATEWAY,
            CesError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CesError::Unauthorized => StatusCode::UNAUTHORIZED,
            CesError::BadRequest(_) => StatusCode::BAD_REQUEST,
            CesError::SessionStopped(_) => StatusCode::GONE,
            CesError::Internal(_) => {
                error!(error = %self.0, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(ErrorBody {
            error: self.0.to_string(),
            error_code: self.0.code().to_string(),
        });

        (status, body).into_response()
    }
}
