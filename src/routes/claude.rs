//! Agent session summaries and the hook sink.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::agent::{AgentEvent, SessionSummary};
use crate::{ApiError, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/:slug", get(get_session))
        .route("/hooks", post(handle_hook))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    Json(state.agent_index.summaries())
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    state
        .agent_index
        .summary_for_slug(&slug)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session for worktree {slug}")))
}

#[derive(Debug, Serialize)]
struct HookAck {
    processed: bool,
}

/// Hook sink: always 2xx, even for events the core ignores (e.g. a missing
/// working directory), so the agent's hook runner never sees failures.
async fn handle_hook(
    State(state): State<Arc<AppState>>,
    Json(event): Json<AgentEvent>,
) -> Json<HookAck> {
    let processed = state.agent_index.handle_event(&event);
    if !processed {
        tracing::debug!("ignored {} hook without working directory", event.event_type);
    }
    Json(HookAck { processed })
}
