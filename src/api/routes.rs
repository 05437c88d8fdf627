//! Router assembly: CORS + tracing layers wrapping the `/api/v1` surface,
//! following the shape of `create_router_with_config_and_auth` in
//! `oqto::api::routes` (permissive CORS by default, a `TraceLayer` at debug
//! level, an optional auth middleware layer).

use axum::http::Method;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;
use crate::auth::require_api_key;

pub fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer();
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    let api = Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions", get(handlers::list_sessions).post(handlers::create_session))
        .route(
            "/sessions/{session_id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/sessions/{session_id}/plugins", post(handlers::load_extension))
        .route("/sessions/{session_id}/execute", post(handlers::execute))
        .route(
            "/sessions/{session_id}/execute/{exec_id}/stream",
            get(handlers::stream_execution),
        )
        .route("/sessions/{session_id}/variables", post(handlers::update_variables))
        .route("/sessions/{session_id}/files", post(handlers::upload_file))
        .route(
            "/sessions/{session_id}/artifacts/{file_name}",
            get(handlers::download_artifact),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .nest("/api/v1", api)
        .layer(cors)
        .layer(trace_layer)
        .with_state(state)
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}
