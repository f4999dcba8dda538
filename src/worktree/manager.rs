//! The worktree manager owns the repository and worktree registries.
//!
//! Key responsibilities:
//! - Discover mounted repositories and recover existing worktrees at startup
//! - Create isolated worktrees pinned to `refs/catnip/<slug>` custom refs
//! - Keep nice branches converged with the custom ref after every commit
//! - Rebase from / merge to the source branch, surfacing conflicts as typed
//!   errors a human resolves in the worktree's own terminal
//! - Publish preview branches for local repositories
//!
//! Long-running git work always happens against value copies outside the
//! registry lock; results are stored in a short critical section.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use chrono::Utc;
use dashmap::DashSet;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::{Event, EventBus, WorktreeStatusPatch};
use crate::config::{AppConfig, BRANCH_SYNC_DEBOUNCE};
use crate::git::{GitCli, GitError};

use super::names;
use super::status::{StatusCache, StatusTarget};
use super::types::{
    branch_map_key, custom_ref, ActivityState, Repository, TitleEntry, Worktree,
    CUSTOM_REF_PREFIX, LIVE_REMOTE, PREVIEW_PREFIX,
};

// ---------------------------------------------------------------------------
// Errors and requests
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("worktree {0} has uncommitted changes (pass force to override)")]
    Dirty(String),
    #[error("source not found: {0}")]
    SourceNotFound(String),
    #[error("{0}")]
    Unsupported(String),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Branch,
    Commit,
    Worktree,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorktreeRequest {
    /// Required unless `source_type` is `worktree` (inherited then).
    pub repo_id: Option<String>,
    pub source: String,
    pub source_type: SourceType,
    /// Optional explicit workspace name; a friendly slug is generated
    /// otherwise.
    pub name: Option<String>,
}

/// Deleting a worktree must stop its PTY session first; the PTY layer
/// registers itself here after construction.
pub trait SessionStopper: Send + Sync {
    fn stop(&self, slug: &str);
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

pub struct WorktreeManager {
    config: AppConfig,
    git: Arc<dyn GitCli>,
    bus: Arc<EventBus>,
    cache: Arc<StatusCache>,
    repositories: RwLock<HashMap<String, Repository>>,
    worktrees: RwLock<HashMap<Uuid, Worktree>>,
    sync_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
    sync_pending: DashSet<Uuid>,
    session_stopper: OnceLock<Arc<dyn SessionStopper>>,
}

impl WorktreeManager {
    pub fn new(config: AppConfig, git: Arc<dyn GitCli>, bus: Arc<EventBus>) -> Arc<Self> {
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let cache = StatusCache::new(git.clone(), bus.clone(), sync_tx);
        Arc::new(Self {
            config,
            git,
            bus,
            cache,
            repositories: RwLock::new(HashMap::new()),
            worktrees: RwLock::new(HashMap::new()),
            sync_rx: Mutex::new(Some(sync_rx)),
            sync_pending: DashSet::new(),
            session_stopper: OnceLock::new(),
        })
    }

    pub fn status_cache(&self) -> Arc<StatusCache> {
        self.cache.clone()
    }

    pub fn git(&self) -> Arc<dyn GitCli> {
        self.git.clone()
    }

    pub fn set_session_stopper(&self, stopper: Arc<dyn SessionStopper>) {
        let _ = self.session_stopper.set(stopper);
    }

    // -----------------------------------------------------------------------
    // Startup: discovery and recovery
    // -----------------------------------------------------------------------

    /// Scan the live directory for mounted repositories and re-register
    /// worktrees that already exist on disk. All in-memory state is derived
    /// from the filesystem, so this fully rebuilds the registries.
    pub async fn bootstrap(&self) {
        self.discover_live_repos().await;
        self.recover_worktrees().await;
    }

    async fn discover_live_repos(&self) {
        let entries = match std::fs::read_dir(&self.config.live_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::info!(
                    "live directory {} not readable, skipping discovery: {e}",
                    self.config.live_dir.display()
                );
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || !path.join(".git").exists() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            // Only repository roots count; a `.git` file inside someone
            // else's checkout (a stray submodule mount) is not a live repo.
            let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
            match self.git.find_root(&path).await {
                Ok(root) if root == canonical => {}
                Ok(root) => {
                    tracing::debug!(
                        "skipping {name}: nested inside repository at {}",
                        root.display()
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!("skipping live repo {name}: {e}");
                    continue;
                }
            }

            let default_branch = match self.git.default_branch(&path).await {
                Ok(branch) => branch,
                Err(e) => {
                    tracing::warn!("skipping live repo {name}: {e}");
                    continue;
                }
            };

            let id = format!("local/{name}");
            let now = Utc::now();
            let repo = Repository {
                id: id.clone(),
                url: path.to_string_lossy().to_string(),
                path,
                default_branch,
                description: None,
                created_at: now,
                last_accessed: now,
            };
            tracing::info!("discovered live repository {id}");
            self.repositories
                .write()
                .expect("repository registry lock poisoned")
                .insert(id, repo);
        }
    }

    async fn recover_worktrees(&self) {
        let repos = self.repositories_snapshot();
        for repo in repos.values() {
            if let Err(e) = self.git.worktree_prune(&repo.path).await {
                tracing::warn!("worktree prune failed for {}: {e}", repo.id);
            }
            let entries = match self.git.worktree_list(&repo.path).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("worktree list failed for {}: {e}", repo.id);
                    continue;
                }
            };

            for entry in entries {
                if entry.is_bare || entry.path == repo.path {
                    continue;
                }
                let Ok(head_ref) = self.git.symbolic_ref_get(&entry.path).await else {
                    continue;
                };
                let Some(slug) = head_ref.strip_prefix(CUSTOM_REF_PREFIX) else {
                    continue;
                };

                match self.recover_one(repo, slug, &entry.path).await {
                    Ok(worktree) => {
                        tracing::info!("recovered worktree {}", worktree.name);
                        self.register(worktree);
                    }
                    Err(e) => {
                        tracing::warn!("failed to recover worktree {slug}: {e}");
                    }
                }
            }
        }
    }

    async fn recover_one(
        &self,
        repo: &Repository,
        slug: &str,
        path: &std::path::Path,
    ) -> Result<Worktree, WorktreeError> {
        let id = match self.git.config_get(path, &wt_config_key(slug, "id")).await? {
            Some(raw) => raw.parse().unwrap_or_else(|_| Uuid::new_v4()),
            None => Uuid::new_v4(),
        };
        let source_branch = self
            .git
            .config_get(path, &wt_config_key(slug, "source-branch"))
            .await?
            .unwrap_or_else(|| repo.default_branch.clone());
        let commit_hash = match self
            .git
            .config_get(path, &wt_config_key(slug, "base-commit"))
            .await?
        {
            Some(hash) => hash,
            None => self.git.rev_parse(path, &source_branch).await?,
        };
        let branch = self
            .git
            .config_get(path, &branch_map_key(&custom_ref(slug)))
            .await?
            .unwrap_or_else(|| slug.to_string());

        let now = Utc::now();
        Ok(Worktree {
            id,
            repo_id: repo.id.clone(),
            name: format!("{}/{slug}", repo.name()),
            path: path.to_path_buf(),
            branch,
            source_branch,
            commit_hash,
            commit_count: 0,
            commits_behind: 0,
            is_dirty: false,
            dirty_files: None,
            has_conflicts: false,
            session_title: None,
            session_title_history: Vec::new(),
            claude_activity_state: ActivityState::Inactive,
            pull_request_url: None,
            created_at: now,
            last_accessed: now,
        })
    }

    /// Spawn the background loops: the status-cache batcher and the debounced
    /// nice-branch sync loop.
    pub fn start(
        self: &Arc<Self>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let cache_handle = self.cache.start(shutdown.clone());

        let manager = self.clone();
        let mut rx = self
            .sync_rx
            .lock()
            .expect("sync rx mutex poisoned")
            .take()
            .expect("worktree manager already started");
        let mut shutdown_rx = shutdown;
        let sync_handle = tokio::spawn(async move {
            loop {
                let id = tokio::select! {
                    id = rx.recv() => match id {
                        Some(id) => id,
                        None => break,
                    },
                    _ = shutdown_rx.changed() => break,
                };

                // Coalesce bursts: one pending sync per worktree.
                if !manager.sync_pending.insert(id) {
                    continue;
                }
                let manager = manager.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(BRANCH_SYNC_DEBOUNCE).await;
                    manager.sync_pending.remove(&id);
                    if let Err(e) = manager.sync_nice_branch(id).await {
                        tracing::debug!("nice-branch sync for {id} failed: {e}");
                    }
                });
            }
        });

        vec![cache_handle, sync_handle]
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn repositories_snapshot(&self) -> HashMap<String, Repository> {
        self.repositories
            .read()
            .expect("repository registry lock poisoned")
            .clone()
    }

    pub fn repository(&self, id: &str) -> Option<Repository> {
        self.repositories
            .read()
            .expect("repository registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn worktree_count(&self) -> usize {
        self.worktrees
            .read()
            .expect("worktree registry lock poisoned")
            .len()
    }

    /// Snapshot of all worktrees with cached status merged in, sorted by
    /// name so the listing (and its ETag) is deterministic.
    pub fn list_worktrees(&self) -> Vec<Worktree> {
        let mut worktrees: Vec<Worktree> = self
            .worktrees
            .read()
            .expect("worktree registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for worktree in &mut worktrees {
            self.merge_status(worktree);
        }
        worktrees.sort_by(|a, b| a.name.cmp(&b.name));
        worktrees
    }

    pub fn get_worktree(&self, id: Uuid) -> Option<Worktree> {
        let mut worktree = self
            .worktrees
            .read()
            .expect("worktree registry lock poisoned")
            .get(&id)
            .cloned()?;
        self.merge_status(&mut worktree);
        Some(worktree)
    }

    pub fn find_by_slug(&self, slug: &str) -> Option<Worktree> {
        let registry = self.worktrees.read().expect("worktree registry lock poisoned");
        registry.values().find(|w| w.slug() == slug).cloned()
    }

    pub fn find_by_path(&self, path: &std::path::Path) -> Option<Worktree> {
        let registry = self.worktrees.read().expect("worktree registry lock poisoned");
        registry.values().find(|w| w.path == path).cloned()
    }

    fn merge_status(&self, worktree: &mut Worktree) {
        if let Some(status) = self.cache.get(worktree.id) {
            worktree.is_dirty = status.is_dirty;
            worktree.commit_count = status.commit_count;
            worktree.commits_behind = status.commits_behind;
            worktree.has_conflicts = status.has_conflicts;
            worktree.dirty_files = if status.dirty_files.is_empty() {
                None
            } else {
                Some(status.dirty_files)
            };
        }
    }

    fn register(&self, worktree: Worktree) {
        self.cache.register(
            worktree.id,
            StatusTarget {
                repo_id: worktree.repo_id.clone(),
                path: worktree.path.clone(),
                source_ref: worktree.source_branch.clone(),
                base_commit: worktree.commit_hash.clone(),
            },
        );
        self.worktrees
            .write()
            .expect("worktree registry lock poisoned")
            .insert(worktree.id, worktree);
    }

    // -----------------------------------------------------------------------
    // Checkout
    // -----------------------------------------------------------------------

    /// Register (local) or clone (remote) a repository and create a worktree
    /// from its default branch.
    pub async fn checkout(&self, owner: &str, name: &str) -> Result<Worktree, WorktreeError> {
        let repo_id = format!("{owner}/{name}");

        if owner == "local" {
            if self.repository(&repo_id).is_none() {
                return Err(WorktreeError::NotFound(format!("repository {repo_id}")));
            }
        } else if self.repository(&repo_id).is_none() {
            let url = format!("https://github.com/{owner}/{name}.git");
            let bare_path = self.config.repos_dir().join(format!("{owner}-{name}.git"));
            if !bare_path.exists() {
                self.git.clone_bare(&url, &bare_path).await?;
            }
            let default_branch = self.git.default_branch(&bare_path).await?;
            let now = Utc::now();
            self.repositories
                .write()
                .expect("repository registry lock poisoned")
                .insert(
                    repo_id.clone(),
                    Repository {
                        id: repo_id.clone(),
                        url,
                        path: bare_path,
                        default_branch,
                        description: None,
                        created_at: now,
                        last_accessed: now,
                    },
                );
        }

        let repo = self
            .repository(&repo_id)
            .ok_or_else(|| WorktreeError::NotFound(format!("repository {repo_id}")))?;
        self.create_worktree(CreateWorktreeRequest {
            repo_id: Some(repo_id),
            source: repo.default_branch.clone(),
            source_type: SourceType::Branch,
            name: None,
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Create / delete
    // -----------------------------------------------------------------------

    pub async fn create_worktree(
        &self,
        req: CreateWorktreeRequest,
    ) -> Result<Worktree, WorktreeError> {
        // Resolve the repository and the start commit.
        let (repo, source_branch, start_commit) = self.resolve_source(&req).await?;

        // Pick a workspace slug.
        let taken: HashSet<String> = {
            let registry = self.worktrees.read().expect("worktree registry lock poisoned");
            registry.values().map(|w| w.slug().to_string()).collect()
        };
        let slug = match &req.name {
            Some(name) => {
                let slug = names::slugify(name);
                if slug.is_empty() {
                    return Err(WorktreeError::Conflict(format!(
                        "name {name:?} has no usable characters"
                    )));
                }
                let full_name = format!("{}/{slug}", repo.name());
                let registry =
                    self.worktrees.read().expect("worktree registry lock poisoned");
                if registry
                    .values()
                    .any(|w| w.repo_id == repo.id && w.name == full_name)
                {
                    return Err(WorktreeError::Conflict(format!(
                        "worktree {full_name} already exists"
                    )));
                }
                slug
            }
            None => names::generate_slug(&taken),
        };

        let path = if repo.is_local() {
            self.config.local_worktree_path(repo.name(), &slug)
        } else {
            self.config.remote_worktree_path(&slug)
        };
        if path.exists() {
            return Err(WorktreeError::Conflict(format!(
                "path {} already in use",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let new_ref = custom_ref(&slug);
        self.git
            .worktree_add(&repo.path, &path, &start_commit, &new_ref)
            .await?;

        if repo.is_local() {
            let repo_url = repo.path.to_string_lossy().to_string();
            self.git.remote_add(&path, LIVE_REMOTE, &repo_url).await?;
        }

        let id = Uuid::new_v4();
        // Persist what recovery needs; these live in the shared repo config,
        // namespaced by slug.
        self.git
            .config_set(&path, &wt_config_key(&slug, "id"), &id.to_string())
            .await?;
        self.git
            .config_set(&path, &wt_config_key(&slug, "source-branch"), &source_branch)
            .await?;
        self.git
            .config_set(&path, &wt_config_key(&slug, "base-commit"), &start_commit)
            .await?;

        let now = Utc::now();
        let worktree = Worktree {
            id,
            repo_id: repo.id.clone(),
            name: format!("{}/{slug}", repo.name()),
            path,
            branch: slug.clone(),
            source_branch,
            commit_hash: start_commit,
            commit_count: 0,
            commits_behind: 0,
            is_dirty: false,
            dirty_files: None,
            has_conflicts: false,
            session_title: None,
            session_title_history: Vec::new(),
            claude_activity_state: ActivityState::Inactive,
            pull_request_url: None,
            created_at: now,
            last_accessed: now,
        };

        self.register(worktree.clone());
        {
            let mut repos = self
                .repositories
                .write()
                .expect("repository registry lock poisoned");
            if let Some(stored) = repos.get_mut(&repo.id) {
                stored.last_accessed = now;
            }
        }
        self.bus.emit(Event::WorktreeCreated {
            worktree_id: worktree.id,
            name: worktree.name.clone(),
        });
        Ok(worktree)
    }

    async fn resolve_source(
        &self,
        req: &CreateWorktreeRequest,
    ) -> Result<(Repository, String, String), WorktreeError> {
        if req.source_type == SourceType::Worktree {
            let source_id: Uuid = req
                .source
                .parse()
                .map_err(|_| WorktreeError::SourceNotFound(req.source.clone()))?;
            let source = self
                .get_worktree(source_id)
                .ok_or_else(|| WorktreeError::SourceNotFound(req.source.clone()))?;
            let repo = self
                .repository(&source.repo_id)
                .ok_or_else(|| WorktreeError::NotFound(source.repo_id.clone()))?;
            // Branch from the source worktree's current HEAD commit, not its
            // branch, so later commits there don't move this worktree.
            let head = self.git.rev_parse(&source.path, "HEAD").await?;
            return Ok((repo, source.source_branch.clone(), head));
        }

        let repo_id = req
            .repo_id
            .as_deref()
            .ok_or_else(|| WorktreeError::SourceNotFound("repo_id is required".into()))?;
        let repo = self
            .repository(repo_id)
            .ok_or_else(|| WorktreeError::NotFound(format!("repository {repo_id}")))?;

        match req.source_type {
            SourceType::Branch => {
                if !repo.is_local() {
                    let refspec = format!("+refs/heads/{0}:refs/heads/{0}", req.source);
                    self.git.fetch(&repo.path, "origin", Some(&refspec)).await?;
                }
                let commit = self
                    .git
                    .rev_parse(&repo.path, &req.source)
                    .await
                    .map_err(|_| WorktreeError::SourceNotFound(req.source.clone()))?;
                Ok((repo, req.source.clone(), commit))
            }
            SourceType::Commit => {
                let commit = self
                    .git
                    .rev_parse(&repo.path, &req.source)
                    .await
                    .map_err(|_| WorktreeError::SourceNotFound(req.source.clone()))?;
                let source_branch = repo.default_branch.clone();
                Ok((repo, source_branch, commit))
            }
            SourceType::Worktree => unreachable!("handled above"),
        }
    }

    pub async fn delete_worktree(&self, id: Uuid, force: bool) -> Result<(), WorktreeError> {
        let worktree = self
            .get_worktree(id)
            .ok_or_else(|| WorktreeError::NotFound(format!("worktree {id}")))?;
        let repo = self
            .repository(&worktree.repo_id)
            .ok_or_else(|| WorktreeError::NotFound(worktree.repo_id.clone()))?;

        // The cache is advisory; re-check through git before refusing or
        // destroying anything.
        if !force {
            let status = self.git.status(&worktree.path).await?;
            if status.is_dirty {
                return Err(WorktreeError::Dirty(worktree.slug().to_string()));
            }
        }

        if let Some(stopper) = self.session_stopper.get() {
            stopper.stop(worktree.slug());
        }
        self.cache.unregister(id);

        self.git
            .worktree_remove(&repo.path, &worktree.path, true)
            .await?;

        let slug = worktree.slug();
        if let Err(e) = self.git.delete_ref(&repo.path, &worktree.custom_ref()).await {
            tracing::warn!("failed to delete {}: {e}", worktree.custom_ref());
        }
        for key in [
            branch_map_key(&worktree.custom_ref()),
            wt_config_key(slug, "id"),
            wt_config_key(slug, "source-branch"),
            wt_config_key(slug, "base-commit"),
        ] {
            if let Err(e) = self.git.config_unset(&repo.path, &key).await {
                tracing::debug!("config unset {key} failed: {e}");
            }
        }

        self.worktrees
            .write()
            .expect("worktree registry lock poisoned")
            .remove(&id);
        self.bus.emit(Event::WorktreeDeleted {
            worktree_id: id,
            name: worktree.name.clone(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sync / merge / preview
    // -----------------------------------------------------------------------

    /// Rebase the worktree onto the latest source branch. A worktree already
    /// up to date is a no-op and emits nothing. On conflict the tree is left
    /// half-rebased for interactive resolution; callers abort explicitly.
    pub async fn sync_worktree(&self, id: Uuid) -> Result<Worktree, WorktreeError> {
        let worktree = self
            .get_worktree(id)
            .ok_or_else(|| WorktreeError::NotFound(format!("worktree {id}")))?;
        let repo = self
            .repository(&worktree.repo_id)
            .ok_or_else(|| WorktreeError::NotFound(worktree.repo_id.clone()))?;

        if !repo.is_local() {
            let refspec = format!("+refs/heads/{0}:refs/heads/{0}", worktree.source_branch);
            self.git.fetch(&repo.path, "origin", Some(&refspec)).await?;
        }

        let behind_range = format!("HEAD..{}", worktree.source_branch);
        if self
            .git
            .rev_list_count(&worktree.path, &behind_range)
            .await?
            == 0
        {
            return Ok(worktree);
        }

        // The cache is advisory; a rebase needs an actually clean tree.
        let status = self.git.status(&worktree.path).await?;
        if status.is_dirty {
            return Err(WorktreeError::Dirty(worktree.slug().to_string()));
        }

        match self
            .git
            .rebase(&worktree.path, &worktree.source_branch)
            .await
        {
            Ok(()) => {}
            Err(err) => {
                // Reflect the conflicted tree in the cache before surfacing.
                self.cache.schedule(id);
                return Err(err.into());
            }
        }

        let new_base = self
            .git
            .rev_parse(&worktree.path, &worktree.source_branch)
            .await?;
        self.update_commit_hash(id, &new_base);
        self.cache.update_base(id, new_base);

        if let Err(e) = self.sync_nice_branch(id).await {
            tracing::debug!("nice-branch sync after rebase failed: {e}");
        }

        self.get_worktree(id)
            .ok_or_else(|| WorktreeError::NotFound(format!("worktree {id}")))
    }

    /// Merge the worktree's HEAD into its source branch. Local repositories
    /// only; remote repositories go through the pull-request flow.
    pub async fn merge_worktree(
        &self,
        id: Uuid,
        squash: bool,
        auto_cleanup: bool,
    ) -> Result<Worktree, WorktreeError> {
        let worktree = self
            .get_worktree(id)
            .ok_or_else(|| WorktreeError::NotFound(format!("worktree {id}")))?;
        let repo = self
            .repository(&worktree.repo_id)
            .ok_or_else(|| WorktreeError::NotFound(worktree.repo_id.clone()))?;

        if !repo.is_local() {
            return Err(WorktreeError::Unsupported(
                "merges of remote repositories are delegated to the pull-request flow".into(),
            ));
        }

        let status = self.git.status(&worktree.path).await?;
        if status.is_dirty {
            return Err(WorktreeError::Dirty(worktree.slug().to_string()));
        }

        // The merge happens in the source checkout; it must actually be on
        // the source branch.
        let repo_head = self.git.symbolic_ref_get(&repo.path).await?;
        let expected = format!("refs/heads/{}", worktree.source_branch);
        if repo_head != expected {
            return Err(WorktreeError::Conflict(format!(
                "source checkout is on {repo_head}, expected {expected}"
            )));
        }

        self.git
            .merge(&repo.path, &worktree.custom_ref(), squash)
            .await?;
        if squash {
            // `merge --squash` stages but does not commit.
            let message = format!("Squash merge of {}", worktree.branch);
            self.git.commit(&repo.path, &message, false).await?;
        }

        let new_base = self.git.rev_parse(&repo.path, "HEAD").await?;
        self.update_commit_hash(id, &new_base);
        self.cache.update_base(id, new_base);

        if auto_cleanup {
            self.delete_worktree(id, true).await?;
            return Ok(worktree);
        }
        self.get_worktree(id)
            .ok_or_else(|| WorktreeError::NotFound(format!("worktree {id}")))
    }

    /// Publish `preview/<branch>` in the underlying local repository with
    /// all committed and uncommitted work, leaving the worktree's observable
    /// state untouched.
    pub async fn preview_worktree(&self, id: Uuid) -> Result<String, WorktreeError> {
        let worktree = self
            .get_worktree(id)
            .ok_or_else(|| WorktreeError::NotFound(format!("worktree {id}")))?;
        let repo = self
            .repository(&worktree.repo_id)
            .ok_or_else(|| WorktreeError::NotFound(worktree.repo_id.clone()))?;
        if !repo.is_local() {
            return Err(WorktreeError::Unsupported(
                "preview branches are only published for local repositories".into(),
            ));
        }

        let status = self.git.status(&worktree.path).await?;
        let preview_branch = format!("{PREVIEW_PREFIX}{}", worktree.branch);

        let snapshot_head = if status.is_dirty {
            let previous_head = self.git.rev_parse(&worktree.path, "HEAD").await?;
            self.git.add_all(&worktree.path).await?;
            self.git
                .commit(&worktree.path, "Preview snapshot", false)
                .await?;
            Some(previous_head)
        } else {
            None
        };

        let refspec = format!("HEAD:refs/heads/{preview_branch}");
        let push_result = self
            .git
            .push(&worktree.path, LIVE_REMOTE, &refspec, true)
            .await;

        // Take the temporary commit back off the custom ref while keeping
        // the user's uncommitted edits in the working tree.
        if let Some(previous_head) = snapshot_head {
            self.git.reset_mixed(&worktree.path, &previous_head).await?;
        }
        push_result?;

        self.cache.schedule(id);
        Ok(preview_branch)
    }

    // -----------------------------------------------------------------------
    // Session titles and nice branches
    // -----------------------------------------------------------------------

    /// Record a session title and, on first observation, create the nice
    /// branch mapped to this worktree's custom ref. The first title names
    /// the branch; later titles only extend the history.
    pub async fn apply_session_title(
        &self,
        id: Uuid,
        title: &str,
        timestamp: chrono::DateTime<Utc>,
    ) -> Result<(), WorktreeError> {
        let worktree = self
            .get_worktree(id)
            .ok_or_else(|| WorktreeError::NotFound(format!("worktree {id}")))?;
        let repo = self
            .repository(&worktree.repo_id)
            .ok_or_else(|| WorktreeError::NotFound(worktree.repo_id.clone()))?;

        let entry = TitleEntry {
            title: title.to_string(),
            timestamp,
        };
        {
            let mut registry =
                self.worktrees.write().expect("worktree registry lock poisoned");
            if let Some(stored) = registry.get_mut(&id) {
                if stored.session_title.as_ref().map(|t| t.title.as_str()) != Some(title) {
                    if let Some(previous) = stored.session_title.take() {
                        stored.session_title_history.push(previous);
                    }
                    stored.session_title = Some(entry);
                }
            }
        }

        let map_key = branch_map_key(&worktree.custom_ref());
        let mut display_branch = None;
        if self.git.config_get(&worktree.path, &map_key).await?.is_none() {
            let existing: HashSet<String> =
                self.git.branches(&worktree.path).await?.into_iter().collect();
            if let Some(nice) = names::branch_from_title(title, |c| existing.contains(c)) {
                self.git.branch_create(&worktree.path, &nice, "HEAD").await?;
                self.git.config_set(&worktree.path, &map_key, &nice).await?;
                if repo.is_local() {
                    let refspec = format!("{nice}:{nice}");
                    if let Err(e) = self
                        .git
                        .push(&worktree.path, LIVE_REMOTE, &refspec, false)
                        .await
                    {
                        tracing::warn!("initial nice-branch push failed: {e}");
                    }
                }

                let mut registry =
                    self.worktrees.write().expect("worktree registry lock poisoned");
                if let Some(stored) = registry.get_mut(&id) {
                    stored.branch = nice.clone();
                }
                display_branch = Some(nice);
            }
        }

        self.bus.emit(Event::WorktreeStatusUpdated {
            worktree_id: id,
            status: WorktreeStatusPatch {
                branch: display_branch,
                session_title: Some(title.to_string()),
                ..Default::default()
            },
        });
        Ok(())
    }

    /// Re-point the nice branch at the custom ref's commit and push it for
    /// local repos. Idempotent: equal tips do nothing.
    pub async fn sync_nice_branch(&self, id: Uuid) -> Result<(), WorktreeError> {
        let Some(worktree) = self.get_worktree(id) else {
            return Ok(());
        };
        let Some(repo) = self.repository(&worktree.repo_id) else {
            return Ok(());
        };

        let map_key = branch_map_key(&worktree.custom_ref());
        let Some(nice) = self.git.config_get(&worktree.path, &map_key).await? else {
            return Ok(());
        };

        let head = self.git.rev_parse(&worktree.path, "HEAD").await?;
        let nice_ref = format!("refs/heads/{nice}");
        let nice_head = self.git.rev_parse(&worktree.path, &nice_ref).await.ok();
        if nice_head.as_deref() == Some(head.as_str()) {
            return Ok(());
        }

        self.git.branch_force(&worktree.path, &nice, "HEAD").await?;
        if repo.is_local() {
            let refspec = format!("{nice}:{nice}");
            if let Err(e) = self
                .git
                .push(&worktree.path, LIVE_REMOTE, &refspec, false)
                .await
            {
                // A host-side checkout may have moved the branch; leave the
                // next commit to retry.
                tracing::warn!("nice-branch push for {} was rejected: {e}", worktree.name);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Small mutators
    // -----------------------------------------------------------------------

    fn update_commit_hash(&self, id: Uuid, commit: &str) {
        let mut registry = self.worktrees.write().expect("worktree registry lock poisoned");
        if let Some(stored) = registry.get_mut(&id) {
            stored.commit_hash = commit.to_string();
        }
    }

    /// Store the new activity state and announce it; hook handling relies on
    /// every event producing a status update.
    pub fn update_activity(&self, id: Uuid, state: ActivityState) {
        {
            let mut registry =
                self.worktrees.write().expect("worktree registry lock poisoned");
            match registry.get_mut(&id) {
                Some(stored) => stored.claude_activity_state = state,
                None => return,
            }
        }
        self.bus.emit(Event::WorktreeStatusUpdated {
            worktree_id: id,
            status: WorktreeStatusPatch {
                claude_activity_state: Some(state),
                ..Default::default()
            },
        });
    }

    pub fn set_pull_request_url(&self, id: Uuid, url: String) {
        let mut registry = self.worktrees.write().expect("worktree registry lock poisoned");
        if let Some(stored) = registry.get_mut(&id) {
            stored.pull_request_url = Some(url);
        }
    }

    pub fn touch(&self, id: Uuid) {
        let mut registry = self.worktrees.write().expect("worktree registry lock poisoned");
        if let Some(stored) = registry.get_mut(&id) {
            stored.last_accessed = Utc::now();
        }
    }
}

fn wt_config_key(slug: &str, field: &str) -> String {
    format!("catnip.worktree.{slug}.{field}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
