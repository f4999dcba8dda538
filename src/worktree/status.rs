//! Pre-computed worktree status, kept fresh by filesystem watchers.
//!
//! Listing worktrees must never spawn git in the request path, so every
//! registered worktree gets a watcher over its working tree and git metadata.
//! Watcher hits enqueue the worktree id; a 100 ms batching window coalesces
//! bursts; a small worker pool recomputes dirty/ahead/behind state and the
//! results land in an in-memory map that `get` reads lock-free.
//!
//! The cache is advisory: operations that need accuracy (sync, merge)
//! re-check status through git at their start.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::bus::{Event, EventBus, WorktreeStatusPatch};
use crate::config::{STATUS_BATCH_WINDOW, STATUS_WORKERS};
use crate::git::GitCli;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Cached status of one worktree. `is_loading` entries have never completed
/// a computation; their numeric fields are placeholders.
#[derive(Debug, Clone, Serialize)]
pub struct WorktreeStatus {
    pub is_dirty: bool,
    pub commit_count: u64,
    pub commits_behind: u64,
    pub has_conflicts: bool,
    pub dirty_files: Vec<String>,
    pub last_updated: DateTime<Utc>,
    pub is_loading: bool,
    pub is_cached: bool,
}

impl WorktreeStatus {
    fn loading() -> Self {
        Self {
            is_dirty: false,
            commit_count: 0,
            commits_behind: 0,
            has_conflicts: false,
            dirty_files: Vec::new(),
            last_updated: Utc::now(),
            is_loading: true,
            is_cached: false,
        }
    }

    fn to_patch(&self) -> WorktreeStatusPatch {
        WorktreeStatusPatch {
            is_dirty: Some(self.is_dirty),
            commit_count: Some(self.commit_count),
            commits_behind: Some(self.commits_behind),
            has_conflicts: Some(self.has_conflicts),
            dirty_files: Some(self.dirty_files.clone()),
            ..Default::default()
        }
    }
}

/// What the workers need to know to recompute one worktree.
#[derive(Debug, Clone)]
pub struct StatusTarget {
    pub repo_id: String,
    pub path: PathBuf,
    /// Ref compared against for `commits_behind` (`origin/<branch>` for
    /// remote repos, the plain branch for local ones).
    pub source_ref: String,
    /// Divergence commit; `commit_count` counts `base..HEAD`.
    pub base_commit: String,
}

// ---------------------------------------------------------------------------
// StatusCache
// ---------------------------------------------------------------------------

pub struct StatusCache {
    git: Arc<dyn GitCli>,
    bus: Arc<EventBus>,
    entries: DashMap<Uuid, WorktreeStatus>,
    targets: DashMap<Uuid, StatusTarget>,
    watchers: DashMap<Uuid, RecommendedWatcher>,
    update_tx: mpsc::UnboundedSender<Uuid>,
    update_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
    /// Worktrees whose nice branch may need syncing after a status refresh;
    /// drained by the manager's debounced sync loop.
    sync_tx: mpsc::UnboundedSender<Uuid>,
}

impl StatusCache {
    pub fn new(
        git: Arc<dyn GitCli>,
        bus: Arc<EventBus>,
        sync_tx: mpsc::UnboundedSender<Uuid>,
    ) -> Arc<Self> {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            git,
            bus,
            entries: DashMap::new(),
            targets: DashMap::new(),
            watchers: DashMap::new(),
            update_tx,
            update_rx: Mutex::new(Some(update_rx)),
            sync_tx,
        })
    }

    /// Register a worktree: the entry starts in the loading state, a watcher
    /// is attached and an initial computation is scheduled.
    pub fn register(&self, id: Uuid, target: StatusTarget) {
        self.entries.insert(id, WorktreeStatus::loading());
        match self.install_watcher(id, &target.path) {
            Ok(watcher) => {
                self.watchers.insert(id, watcher);
            }
            Err(e) => {
                tracing::warn!("failed to watch worktree {id}: {e}");
            }
        }
        self.targets.insert(id, target);
        self.schedule(id);
    }

    pub fn unregister(&self, id: Uuid) {
        self.watchers.remove(&id);
        self.targets.remove(&id);
        self.entries.remove(&id);
    }

    /// Never touches git; returns the current cached record including its
    /// loading flag.
    pub fn get(&self, id: Uuid) -> Option<WorktreeStatus> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    /// Enqueue a recomputation (deduplicated inside the batching window).
    pub fn schedule(&self, id: Uuid) {
        let _ = self.update_tx.send(id);
    }

    /// Update the divergence base after a sync or merge moved it.
    pub fn update_base(&self, id: Uuid, base_commit: String) {
        if let Some(mut target) = self.targets.get_mut(&id) {
            target.base_commit = base_commit;
        }
        self.schedule(id);
    }

    fn install_watcher(&self, id: Uuid, path: &Path) -> notify::Result<RecommendedWatcher> {
        let tx = self.update_tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.send(id);
            }
        })?;

        watcher.watch(path, RecursiveMode::Recursive)?;
        for git_path in git_metadata_paths(path) {
            if git_path.exists() {
                let mode = if git_path.is_dir() {
                    RecursiveMode::Recursive
                } else {
                    RecursiveMode::NonRecursive
                };
                if let Err(e) = watcher.watch(&git_path, mode) {
                    tracing::debug!("failed to watch {}: {e}", git_path.display());
                }
            }
        }
        Ok(watcher)
    }

    /// Spawn the batch/compute loop. Runs until `shutdown` flips or the
    /// update channel closes.
    pub fn start(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        let mut rx = self
            .update_rx
            .lock()
            .expect("status cache rx mutex poisoned")
            .take()
            .expect("status cache already started");

        tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    id = rx.recv() => match id {
                        Some(id) => id,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                };

                let mut batch = HashSet::new();
                batch.insert(first);

                let window = tokio::time::sleep(STATUS_BATCH_WINDOW);
                tokio::pin!(window);
                loop {
                    tokio::select! {
                        id = rx.recv() => match id {
                            Some(id) => { batch.insert(id); }
                            None => break,
                        },
                        _ = &mut window => break,
                    }
                }

                cache.process_batch(batch).await;
            }
        })
    }

    async fn process_batch(self: &Arc<Self>, batch: HashSet<Uuid>) {
        let semaphore = Arc::new(Semaphore::new(STATUS_WORKERS));
        let mut join = JoinSet::new();

        for id in batch {
            let cache = self.clone();
            let semaphore = semaphore.clone();
            join.spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                cache.compute_one(id).await
            });
        }

        let mut updates: Vec<(Uuid, StatusTransition)> = Vec::new();
        while let Some(result) = join.join_next().await {
            match result {
                Ok(Some(update)) => updates.push(update),
                Ok(None) => {}
                Err(e) => tracing::error!("status worker panicked: {e}"),
            }
        }

        if updates.is_empty() {
            return;
        }

        // Dirty transitions first, then the coalesced status event.
        for (id, transition) in &updates {
            match transition.dirty_flip {
                Some(true) => {
                    self.bus.emit(Event::GitDirty {
                        repo_id: transition.repo_id.clone(),
                        worktree_id: *id,
                    });
                    self.bus.emit(Event::WorktreeDirty { worktree_id: *id });
                }
                Some(false) => {
                    self.bus.emit(Event::GitClean {
                        repo_id: transition.repo_id.clone(),
                        worktree_id: *id,
                    });
                    self.bus.emit(Event::WorktreeClean { worktree_id: *id });
                }
                None => {}
            }
        }

        if updates.len() == 1 {
            let (id, transition) = &updates[0];
            self.bus.emit(Event::WorktreeStatusUpdated {
                worktree_id: *id,
                status: transition.patch.clone(),
            });
        } else {
            let statuses: HashMap<Uuid, WorktreeStatusPatch> = updates
                .iter()
                .map(|(id, t)| (*id, t.patch.clone()))
                .collect();
            self.bus.emit(Event::WorktreeBatchUpdated { statuses });
        }

        for (id, _) in &updates {
            let _ = self.sync_tx.send(*id);
        }
    }

    /// Run the three git reads for one worktree and store the result. The
    /// cache lock is never held across the git calls.
    async fn compute_one(&self, id: Uuid) -> Option<(Uuid, StatusTransition)> {
        let target = self.targets.get(&id)?.value().clone();

        let status = match self.git.status(&target.path).await {
            Ok(status) => status,
            Err(e) => {
                // The worktree may be mid-delete; keep the stale entry.
                tracing::debug!("status read failed for {}: {e}", target.path.display());
                return None;
            }
        };
        let ahead_range = format!("{}..HEAD", target.base_commit);
        let behind_range = format!("{}..{}", target.base_commit, target.source_ref);
        let commit_count = self
            .git
            .rev_list_count(&target.path, &ahead_range)
            .await
            .unwrap_or(0);
        let commits_behind = self
            .git
            .rev_list_count(&target.path, &behind_range)
            .await
            .unwrap_or(0);

        let new = WorktreeStatus {
            is_dirty: status.is_dirty,
            commit_count,
            commits_behind,
            has_conflicts: status.has_conflicts,
            dirty_files: status.files,
            last_updated: Utc::now(),
            is_loading: false,
            is_cached: true,
        };

        let previous = self.entries.insert(id, new.clone());
        let dirty_flip = match previous {
            Some(prev) if !prev.is_loading => {
                (prev.is_dirty != new.is_dirty).then_some(new.is_dirty)
            }
            _ => new.is_dirty.then_some(true),
        };

        Some((
            id,
            StatusTransition {
                repo_id: target.repo_id,
                patch: new.to_patch(),
                dirty_flip,
            },
        ))
    }
}

struct StatusTransition {
    repo_id: String,
    patch: WorktreeStatusPatch,
    dirty_flip: Option<bool>,
}

/// Git metadata paths worth watching for a worktree, resolving the
/// `.git`-file indirection linked worktrees use. HEAD and index live in the
/// per-worktree gitdir; refs/heads lives in the common dir.
fn git_metadata_paths(worktree: &Path) -> Vec<PathBuf> {
    let dot_git = worktree.join(".git");
    let gitdir = if dot_git.is_file() {
        match std::fs::read_to_string(&dot_git) {
            Ok(contents) => contents
                .trim()
                .strip_prefix("gitdir: ")
                .map(PathBuf::from)
                .unwrap_or(dot_git),
            Err(_) => return vec![],
        }
    } else {
        dot_git
    };

    let common_dir = match std::fs::read_to_string(gitdir.join("commondir")) {
        Ok(rel) => {
            let rel = rel.trim();
            let joined = gitdir.join(rel);
            joined.canonicalize().unwrap_or(joined)
        }
        Err(_) => gitdir.clone(),
    };

    vec![
        gitdir.join("HEAD"),
        gitdir.join("index"),
        common_dir.join("refs").join("heads"),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
