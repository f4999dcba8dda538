//! Catnip backend library.
//!
//! The worktree & session core behind the agentic-coding workbench. It
//! handles:
//! - Worktree management over mounted and remote git repositories
//! - A watcher-driven status cache so listing never runs git
//! - PTY session multiplexing with TUI-aware reconnect replay
//! - Indexing of on-disk agent transcripts and hook events
//! - Fan-out of everything as Server-Sent Events
//!
//! # Architecture
//!
//! The backend follows a modular architecture:
//! - `routes`: HTTP/SSE/WebSocket handlers (the external surface)
//! - `worktree`: worktree manager and status cache
//! - `pty`: PTY session multiplexer
//! - `agent`: agent session index and hook intake
//! - `git`: subprocess capability layer
//! - `bus`: event bus for real-time communication

pub mod agent;
pub mod bus;
pub mod config;
pub mod git;
pub mod pty;
pub mod routes;
pub mod worktree;

#[cfg(test)]
pub mod test_support;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use agent::AgentSessionIndex;
use bus::EventBus;
use config::AppConfig;
use git::{redact_credentials, GitError};
use pty::SessionManager;
use worktree::{Worktree, WorktreeError, WorktreeManager};

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

/// Errors crossing the HTTP boundary, mapped to status codes in one place.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Dirty(String),
    #[error("{operation} conflict in {worktree_name}")]
    MergeConflict {
        operation: String,
        worktree_name: String,
        conflict_files: Vec<String>,
    },
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("{0}")]
    Internal(String),
}

impl From<WorktreeError> for ApiError {
    fn from(value: WorktreeError) -> Self {
        match value {
            WorktreeError::NotFound(what) => ApiError::NotFound(what),
            WorktreeError::Conflict(what) => ApiError::Conflict(what),
            WorktreeError::Dirty(slug) => ApiError::Dirty(format!(
                "worktree {slug} has uncommitted changes (pass force to override)"
            )),
            WorktreeError::SourceNotFound(what) => {
                ApiError::BadRequest(format!("source not found: {what}"))
            }
            WorktreeError::Unsupported(what) => ApiError::Unsupported(what),
            WorktreeError::Git(err) => err.into(),
            WorktreeError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<GitError> for ApiError {
    fn from(value: GitError) -> Self {
        match value {
            GitError::MergeConflict {
                operation,
                worktree_name,
                conflict_files,
                ..
            } => ApiError::MergeConflict {
                operation,
                worktree_name,
                conflict_files,
            },
            other => ApiError::Internal(redact_credentials(&other.to_string())),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({"error": "not_found", "message": message}),
            ),
            ApiError::Conflict(message) => (
                StatusCode::CONFLICT,
                serde_json::json!({"error": "conflict", "message": message}),
            ),
            ApiError::Dirty(message) => (
                StatusCode::CONFLICT,
                serde_json::json!({"error": "dirty", "message": message}),
            ),
            ApiError::MergeConflict {
                operation,
                worktree_name,
                conflict_files,
            } => (
                StatusCode::CONFLICT,
                serde_json::json!({
                    "error": "merge_conflict",
                    "operation": operation,
                    "worktree_name": worktree_name,
                    "conflict_files": conflict_files,
                    "message": format!(
                        "resolve the conflicts in the terminal session of {worktree_name}"
                    ),
                }),
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({"error": "bad_request", "message": message}),
            ),
            ApiError::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({"error": "unauthorized", "message": message}),
            ),
            ApiError::Unsupported(message) => (
                StatusCode::NOT_IMPLEMENTED,
                serde_json::json!({"error": "unsupported", "message": message}),
            ),
            ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"error": "internal", "message": message}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Pull requests (external collaborator contract)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequestInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Capability the GitHub-proxy collaborator implements. The bundled null
/// provider serves stored URLs and rejects mutations.
#[async_trait]
pub trait PullRequestProvider: Send + Sync {
    async fn get(&self, worktree: &Worktree) -> Result<PullRequestInfo, ApiError>;
    async fn create(
        &self,
        worktree: &Worktree,
        title: &str,
        body: &str,
    ) -> Result<PullRequestInfo, ApiError>;
    async fn update(
        &self,
        worktree: &Worktree,
        title: Option<&str>,
        body: Option<&str>,
    ) -> Result<PullRequestInfo, ApiError>;
}

pub struct NullPullRequestProvider;

#[async_trait]
impl PullRequestProvider for NullPullRequestProvider {
    async fn get(&self, worktree: &Worktree) -> Result<PullRequestInfo, ApiError> {
        Ok(PullRequestInfo {
            url: worktree.pull_request_url.clone(),
            title: None,
            state: None,
        })
    }

    async fn create(
        &self,
        _worktree: &Worktree,
        _title: &str,
        _body: &str,
    ) -> Result<PullRequestInfo, ApiError> {
        Err(ApiError::Unsupported(
            "pull-request provider not configured".into(),
        ))
    }

    async fn update(
        &self,
        _worktree: &Worktree,
        _title: Option<&str>,
        _body: Option<&str>,
    ) -> Result<PullRequestInfo, ApiError> {
        Err(ApiError::Unsupported(
            "pull-request provider not configured".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub config: AppConfig,
    pub bus: Arc<EventBus>,
    pub manager: Arc<WorktreeManager>,
    pub pty: Arc<SessionManager>,
    pub agent_index: Arc<AgentSessionIndex>,
    pub pr_provider: Arc<dyn PullRequestProvider>,
}
