//! Shared fixtures for integration tests: a scratch workspace with a live
//! repository and a fully wired manager.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use catnip::bus::EventBus;
use catnip::config::AppConfig;
use catnip::git::SystemGit;
use catnip::worktree::WorktreeManager;

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("failed to execute git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

pub fn init_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "test@catnip.local"]);
    git(dir, &["config", "user.name", "Catnip Test"]);
    std::fs::write(dir.join("README.md"), "# test repo\n").expect("write failed");
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "initial commit"]);
}

pub fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
    std::fs::write(dir.join(name), content).expect("write failed");
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", message]);
}

pub struct Fixture {
    /// Held for its lifetime; everything lives under this directory.
    pub _root: tempfile::TempDir,
    pub config: AppConfig,
    pub bus: Arc<EventBus>,
    pub manager: Arc<WorktreeManager>,
}

impl Fixture {
    pub fn live_repo(&self) -> PathBuf {
        self.config.live_dir.join("test-live-repo")
    }
}

pub async fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let live_dir = root.path().join("live");
    let repo_dir = live_dir.join("test-live-repo");
    std::fs::create_dir_all(&repo_dir).unwrap();
    init_repo(&repo_dir);

    let config = AppConfig {
        workspace_root: root.path().join("workspace"),
        live_dir,
        state_dir: root.path().join("state"),
        claude_projects_dir: root.path().join("projects"),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        session_command: "true".into(),
    };
    let bus = Arc::new(EventBus::new());
    let manager = WorktreeManager::new(config.clone(), Arc::new(SystemGit::new()), bus.clone());
    manager.bootstrap().await;

    Fixture {
        _root: root,
        config,
        bus,
        manager,
    }
}
