//! Optional shared-secret authentication.
//!
//! An `axum::middleware::from_fn_with_state` layer that rejects the request
//! before it reaches a handler. Unlike a full JWT/session-cookie scheme,
//! this only needs a single static `X-API-Key` header compared against
//! configuration.

use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::error::CesError;

const API_KEY_HEADER: &str = "x-api-key";

/// Rejects requests missing or mismatching the configured API key. A no-op
/// when no key is configured. Requests from a loopback peer address bypass
/// the check, for local tooling and health probes.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    if is_loopback(&req) {
        return Ok(next.run(req).await);
    }

    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(key) if key == expected => Ok(next.run(req).await),
        _ => Err(ApiError::from(CesError::Unauthorized)),
    }
}

fn is_loopback(req: &Request<axum::body::Body>) -> bool {
    req.extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip().is_loopback())
        .unwrap_or(false)
}
