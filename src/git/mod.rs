//! Thin capability surface over `git` subprocess invocations.
//!
//! Every filesystem-mutating git operation the worktree manager and status
//! cache perform goes through the [`GitCli`] trait so tests can substitute a
//! mock and the manager can be driven by a single timeout/retry policy.

mod cli;

pub use cli::{
    redact_credentials, DiffStat, GitCli, GitError, SystemGit, WorkingStatus, WorktreeListEntry,
};
