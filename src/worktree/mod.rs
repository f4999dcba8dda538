//! Worktree management: repositories, worktrees, status caching.
//!
//! - `types`: the Repository/Worktree data model and ref naming helpers
//! - `names`: workspace-slug and nice-branch name derivation
//! - `manager`: owns both registries; create/delete/sync/merge/preview and
//!   the custom-ref ↔ nice-branch protocol
//! - `status`: filesystem-watcher driven status cache so listing never
//!   spawns git

pub mod manager;
pub mod names;
pub mod status;
mod types;

pub use manager::{CreateWorktreeRequest, SessionStopper, SourceType, WorktreeError, WorktreeManager};
pub use status::{StatusCache, WorktreeStatus};
pub use types::{
    branch_map_key, custom_ref, ActivityState, Repository, TitleEntry, Worktree, CUSTOM_REF_PREFIX,
    LIVE_REMOTE, PREVIEW_PREFIX,
};
