//! API route definitions.

use axum::http::{Method, header};
use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::ws::ws_handler;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::HeaderName::from_static("x-user-id"),
        ]);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        // Container pool
        .route("/containers", get(handlers::list_containers))
        .route("/containers", post(handlers::create_container))
        .route("/containers/{container_id}", delete(handlers::stop_container))
        // Custom images
        .route("/images/import", post(handlers::import_image))
        // Sessions
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/restore", post(handlers::restore_session))
        .route("/sessions/{session_id}/logs", get(handlers::session_logs))
        // Monitoring
        .route("/alerts", get(handlers::alerts))
        .route("/metrics/latest", get(handlers::latest_metrics))
        // Terminal transport
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(trace_layer)
        .with_state(state)
}
