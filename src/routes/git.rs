//! Repository and worktree routes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::git::GitCli;
use crate::worktree::{CreateWorktreeRequest, Repository, Worktree};
use crate::{ApiError, AppState, PullRequestInfo};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(repo_status))
        .route("/checkout/:owner/:name", post(checkout))
        .route("/worktrees", get(list_worktrees).post(create_worktree))
        .route("/worktrees/:id", delete(delete_worktree))
        .route("/worktrees/:id/sync", post(sync_worktree))
        .route("/worktrees/:id/merge", post(merge_worktree))
        .route("/worktrees/:id/preview", post(preview_worktree))
        .route("/worktrees/:id/diff", get(worktree_diff))
        .route(
            "/worktrees/:id/pr",
            get(get_pull_request)
                .post(create_pull_request)
                .put(update_pull_request),
        )
}

// ---------------------------------------------------------------------------
// Repository status
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RepoStatusView {
    repositories: HashMap<String, Repository>,
    worktree_count: usize,
}

async fn repo_status(State(state): State<Arc<AppState>>) -> Json<RepoStatusView> {
    Json(RepoStatusView {
        repositories: state.manager.repositories_snapshot(),
        worktree_count: state.manager.worktree_count(),
    })
}

// ---------------------------------------------------------------------------
// Worktree listing with conditional requests
// ---------------------------------------------------------------------------

/// Strong ETag over the serialized body: a pure function of the payload, so
/// repeated identical listings cost neither bytes nor git invocations.
pub(crate) fn etag_for(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("\"{}\"", hex::encode(digest))
}

async fn list_worktrees(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let worktrees = state.manager.list_worktrees();
    let body = match serde_json::to_vec(&worktrees) {
        Ok(body) => body,
        Err(e) => return ApiError::Internal(e.to_string()).into_response(),
    };
    let etag = etag_for(&body);

    if let Some(candidate) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if candidate == etag {
            return ([(header::ETAG, etag)], StatusCode::NOT_MODIFIED).into_response();
        }
    }

    (
        [
            (header::ETAG, etag),
            (header::CONTENT_TYPE, "application/json".to_string()),
        ],
        body,
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

async fn checkout(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<Worktree>, ApiError> {
    let worktree = state.manager.checkout(&owner, &name).await?;
    Ok(Json(worktree))
}

async fn create_worktree(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWorktreeRequest>,
) -> Result<(StatusCode, Json<Worktree>), ApiError> {
    let worktree = state.manager.create_worktree(req).await?;
    Ok((StatusCode::CREATED, Json(worktree)))
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    force: bool,
}

async fn delete_worktree(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<DeleteParams>,
) -> Result<StatusCode, ApiError> {
    state.manager.delete_worktree(id, params.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sync_worktree(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Worktree>, ApiError> {
    let worktree = state.manager.sync_worktree(id).await?;
    Ok(Json(worktree))
}

#[derive(Debug, Default, Deserialize)]
struct MergeBody {
    #[serde(default)]
    squash: bool,
}

#[derive(Debug, Deserialize)]
struct MergeParams {
    #[serde(default)]
    auto_cleanup: bool,
}

async fn merge_worktree(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<MergeParams>,
    body: Option<Json<MergeBody>>,
) -> Result<Json<Worktree>, ApiError> {
    let Json(body) = body.unwrap_or_default();
    let worktree = state
        .manager
        .merge_worktree(id, body.squash, params.auto_cleanup)
        .await?;
    Ok(Json(worktree))
}

#[derive(Debug, Serialize)]
struct PreviewView {
    branch: String,
}

async fn preview_worktree(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PreviewView>, ApiError> {
    let branch = state.manager.preview_worktree(id).await?;
    Ok(Json(PreviewView { branch }))
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct FileDiffView {
    path: String,
    additions: u64,
    deletions: u64,
    untracked: bool,
}

#[derive(Debug, Serialize)]
struct WorktreeDiffView {
    files: Vec<FileDiffView>,
    patch: String,
}

/// Aggregated diff against the divergence commit, including untracked files
/// so the UI shows work the agent has not staged yet.
async fn worktree_diff(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorktreeDiffView>, ApiError> {
    let worktree = state
        .manager
        .get_worktree(id)
        .ok_or_else(|| ApiError::NotFound(format!("worktree {id}")))?;
    let git = state.manager.git();

    let stats = git.diff_numstat(&worktree.path, &worktree.commit_hash).await?;
    let patch = git.diff_patch(&worktree.path, &worktree.commit_hash).await?;
    let status = git.status(&worktree.path).await?;

    let mut files: Vec<FileDiffView> = stats
        .into_iter()
        .map(|stat| FileDiffView {
            path: stat.path,
            additions: stat.additions,
            deletions: stat.deletions,
            untracked: false,
        })
        .collect();

    for dirty in status.files {
        if files.iter().any(|f| f.path == dirty) {
            continue;
        }
        let additions = std::fs::read_to_string(worktree.path.join(&dirty))
            .map(|content| content.lines().count() as u64)
            .unwrap_or(0);
        files.push(FileDiffView {
            path: dirty,
            additions,
            deletions: 0,
            untracked: true,
        });
    }

    Ok(Json(WorktreeDiffView { files, patch }))
}

// ---------------------------------------------------------------------------
// Pull requests (delegated)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreatePullRequestBody {
    title: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct UpdatePullRequestBody {
    title: Option<String>,
    body: Option<String>,
}

async fn get_pull_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PullRequestInfo>, ApiError> {
    let worktree = state
        .manager
        .get_worktree(id)
        .ok_or_else(|| ApiError::NotFound(format!("worktree {id}")))?;
    Ok(Json(state.pr_provider.get(&worktree).await?))
}

async fn create_pull_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<CreatePullRequestBody>,
) -> Result<Json<PullRequestInfo>, ApiError> {
    let worktree = state
        .manager
        .get_worktree(id)
        .ok_or_else(|| ApiError::NotFound(format!("worktree {id}")))?;
    let info = state
        .pr_provider
        .create(&worktree, &body.title, &body.body)
        .await?;
    if let Some(url) = &info.url {
        state.manager.set_pull_request_url(id, url.clone());
    }
    Ok(Json(info))
}

async fn update_pull_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdatePullRequestBody>,
) -> Result<Json<PullRequestInfo>, ApiError> {
    let worktree = state
        .manager
        .get_worktree(id)
        .ok_or_else(|| ApiError::NotFound(format!("worktree {id}")))?;
    let info = state
        .pr_provider
        .update(&worktree, body.title.as_deref(), body.body.as_deref())
        .await?;
    if let Some(url) = &info.url {
        state.manager.set_pull_request_url(id, url.clone());
    }
    Ok(Json(info))
}
