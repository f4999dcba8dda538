//! Shared helpers for tests that need real git repositories.

use std::path::Path;
use std::process::Command;

/// Run git in `dir`, panicking on failure. Test-only.
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

/// Initialize a repository with a configured identity and one commit so
/// HEAD exists.
pub fn init_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "test@catnip.local"]);
    git(dir, &["config", "user.name", "Catnip Test"]);
    std::fs::write(dir.join("README.md"), "# test repo\n").expect("write failed");
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "initial commit"]);
}

/// Write a file and commit it.
pub fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(path, content).expect("write failed");
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", message]);
}
