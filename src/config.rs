//! Process configuration.
//!
//! Everything the components need is collected into one [`AppConfig`] record
//! built from `CATNIP_*` environment variables (with `.env` support) and
//! threaded explicitly to each constructor. There is no global configuration
//! state.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

/// Broadcast capacity of the event bus; at typical event rates this is about
/// one second of backlog before a slow subscriber is dropped.
pub const BUS_CAPACITY: usize = 1024;

/// Interval between `heartbeat` events on the bus.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Coalescing window for worktree status recomputation.
pub const STATUS_BATCH_WINDOW: Duration = Duration::from_millis(100);

/// Number of concurrent status workers.
pub const STATUS_WORKERS: usize = 4;

/// Debounce applied to nice-branch sync after a commit is observed.
pub const BRANCH_SYNC_DEBOUNCE: Duration = Duration::from_millis(500);

/// Soft timeout applied to every git subprocess invocation.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum bytes of PTY scrollback retained per session.
pub const PTY_SCROLLBACK_BYTES: usize = 1024 * 1024;

/// How long background workers get to drain on shutdown.
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root under which bare repos and worktrees are materialized.
    pub workspace_root: PathBuf,
    /// Directory scanned for bare-metal mounted repositories.
    pub live_dir: PathBuf,
    /// Per-process state directory (title log, scrollback state).
    pub state_dir: PathBuf,
    /// Root of the agent's transcript tree (`~/.claude/projects`).
    pub claude_projects_dir: PathBuf,
    /// HTTP bind address.
    pub bind_addr: SocketAddr,
    /// Command a PTY session runs when a client first attaches.
    pub session_command: String,
}

impl AppConfig {
    /// Build the configuration from the environment. Missing variables fall
    /// back to the container defaults.
    pub fn from_env() -> Self {
        let home = home_dir();

        let workspace_root = env_path("CATNIP_WORKSPACE_ROOT")
            .unwrap_or_else(|| home.join("workspace"));
        let live_dir = env_path("CATNIP_LIVE_DIR").unwrap_or_else(|| PathBuf::from("/live"));
        let state_dir = env_path("CATNIP_STATE_DIR").unwrap_or_else(|| home.join(".catnip"));
        let claude_projects_dir = env_path("CATNIP_CLAUDE_PROJECTS_DIR")
            .unwrap_or_else(|| home.join(".claude").join("projects"));

        let bind_addr = std::env::var("CATNIP_BIND")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(|| "0.0.0.0:6369".parse().expect("valid default bind addr"));

        let session_command = std::env::var("CATNIP_SESSION_COMMAND")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/bash".to_string());

        Self {
            workspace_root,
            live_dir,
            state_dir,
            claude_projects_dir,
            bind_addr,
            session_command,
        }
    }

    /// Directory holding bare clones of remote repositories.
    pub fn repos_dir(&self) -> PathBuf {
        self.workspace_root.join("repos")
    }

    /// Worktree directory for a remote-repo workspace slug.
    pub fn remote_worktree_path(&self, slug: &str) -> PathBuf {
        self.workspace_root.join("worktrees").join(slug)
    }

    /// Worktree directory for a local-repo workspace slug.
    pub fn local_worktree_path(&self, project: &str, slug: &str) -> PathBuf {
        self.workspace_root.join(project).join(slug)
    }

    /// Path of the append-only terminal title log.
    pub fn title_log_path(&self) -> PathBuf {
        self.state_dir.join("title_events.log")
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn home_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home);
    }
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home);
    }
    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let config = AppConfig::from_env();
        assert!(config.bind_addr.port() > 0);
        assert!(!config.session_command.is_empty());
        assert!(config.repos_dir().ends_with("repos"));
    }

    #[test]
    fn test_worktree_paths() {
        let config = AppConfig {
            workspace_root: PathBuf::from("/workspace"),
            live_dir: PathBuf::from("/live"),
            state_dir: PathBuf::from("/state"),
            claude_projects_dir: PathBuf::from("/projects"),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            session_command: "bash".into(),
        };
        assert_eq!(
            config.remote_worktree_path("muddy-cat"),
            PathBuf::from("/workspace/worktrees/muddy-cat")
        );
        assert_eq!(
            config.local_worktree_path("catnip", "muddy-cat"),
            PathBuf::from("/workspace/catnip/muddy-cat")
        );
    }
}
