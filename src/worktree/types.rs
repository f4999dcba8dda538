use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// All worktree HEADs live under this ref namespace so nice branches stay
/// independently checkoutable.
pub const CUSTOM_REF_PREFIX: &str = "refs/catnip/";

/// Remote configured in worktrees of local repositories, pointing back at
/// the mounted repo so nice branches can be pushed without a network.
pub const LIVE_REMOTE: &str = "catnip-live";

/// Namespace of throwaway branches published by the preview operation.
pub const PREVIEW_PREFIX: &str = "preview/";

/// The custom ref a workspace slug is pinned to.
pub fn custom_ref(slug: &str) -> String {
    format!("{CUSTOM_REF_PREFIX}{slug}")
}

/// Git-config key storing the custom-ref → nice-branch mapping, e.g.
/// `catnip.branch-map.refs.catnip.muddy-cat`.
pub fn branch_map_key(custom_ref: &str) -> String {
    format!("catnip.branch-map.{}", custom_ref.replace('/', "."))
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A known repository. `local/<name>` ids are bare-metal mounts from the
/// live directory; `<owner>/<name>` ids are bare clones of remotes.
#[derive(Debug, Clone, Serialize)]
pub struct Repository {
    pub id: String,
    pub url: String,
    pub path: PathBuf,
    pub default_branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl Repository {
    pub fn is_local(&self) -> bool {
        self.id.starts_with("local/")
    }

    /// Project segment of the id (`catnip` for `local/catnip`).
    pub fn name(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }
}

/// How recently the agent was working in a worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    Inactive,
    Active,
    Running,
}

impl Default for ActivityState {
    fn default() -> Self {
        ActivityState::Inactive
    }
}

/// One observed terminal title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleEntry {
    pub title: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Worktree {
    pub id: Uuid,
    pub repo_id: String,
    /// `<project>/<workspace-slug>`.
    pub name: String,
    pub path: PathBuf,
    /// Display branch: the slug until a nice branch is mapped.
    pub branch: String,
    /// The branch this worktree diverged from.
    pub source_branch: String,
    /// Divergence commit; updated after merges and syncs.
    pub commit_hash: String,
    pub commit_count: u64,
    pub commits_behind: u64,
    pub is_dirty: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirty_files: Option<Vec<String>>,
    pub has_conflicts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_title: Option<TitleEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub session_title_history: Vec<TitleEntry>,
    pub claude_activity_state: ActivityState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl Worktree {
    /// Workspace segment of the name; doubles as the PTY session id and the
    /// worktree directory name.
    pub fn slug(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn custom_ref(&self) -> String {
        custom_ref(self.slug())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_ref_naming() {
        assert_eq!(custom_ref("muddy-cat"), "refs/catnip/muddy-cat");
        assert_eq!(
            branch_map_key("refs/catnip/muddy-cat"),
            "catnip.branch-map.refs.catnip.muddy-cat"
        );
    }

    #[test]
    fn test_repository_kinds() {
        let now = Utc::now();
        let local = Repository {
            id: "local/test-live-repo".into(),
            url: "/live/test-live-repo".into(),
            path: PathBuf::from("/live/test-live-repo"),
            default_branch: "main".into(),
            description: None,
            created_at: now,
            last_accessed: now,
        };
        assert!(local.is_local());
        assert_eq!(local.name(), "test-live-repo");

        let remote = Repository {
            id: "wandb/catnip".into(),
            url: "https://github.com/wandb/catnip.git".into(),
            path: PathBuf::from("/workspace/repos/wandb-catnip.git"),
            default_branch: "main".into(),
            description: None,
            created_at: now,
            last_accessed: now,
        };
        assert!(!remote.is_local());
    }
}
