//! HTTP/SSE/WebSocket surface consumed by the UI and the agent hooks.

pub mod claude;
pub mod events;
pub mod git;
pub mod pty;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/v1/git", git::router())
        .route("/v1/events", get(events::stream))
        .nest("/v1/claude", claude::router())
        .route("/v1/pty/:slug", get(pty::attach))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
