//! The closed set of events emitted on the bus.
//!
//! Every event serializes as `{"type": ..., "payload": ...}` so the SSE
//! layer can forward it verbatim, one JSON object per `data:` line.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worktree::ActivityState;

/// Sparse status fields attached to `worktree:status_updated` events. Only
/// the fields that changed are populated; clients merge them over their
/// current view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorktreeStatusPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dirty: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commits_behind: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_conflicts: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirty_files: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_activity_state: Option<ActivityState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    #[serde(rename = "port:opened")]
    PortOpened { port: u16 },
    #[serde(rename = "port:closed")]
    PortClosed { port: u16 },
    #[serde(rename = "git:dirty")]
    GitDirty { repo_id: String, worktree_id: Uuid },
    #[serde(rename = "git:clean")]
    GitClean { repo_id: String, worktree_id: Uuid },
    #[serde(rename = "process:started")]
    ProcessStarted { session_id: String, pid: u32 },
    #[serde(rename = "process:stopped")]
    ProcessStopped {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    #[serde(rename = "container:status")]
    ContainerStatus(ContainerStatus),
    #[serde(rename = "worktree:status_updated")]
    WorktreeStatusUpdated {
        worktree_id: Uuid,
        status: WorktreeStatusPatch,
    },
    #[serde(rename = "worktree:batch_updated")]
    WorktreeBatchUpdated {
        statuses: HashMap<Uuid, WorktreeStatusPatch>,
    },
    #[serde(rename = "worktree:dirty")]
    WorktreeDirty { worktree_id: Uuid },
    #[serde(rename = "worktree:clean")]
    WorktreeClean { worktree_id: Uuid },
    #[serde(rename = "worktree:created")]
    WorktreeCreated { worktree_id: Uuid, name: String },
    #[serde(rename = "worktree:deleted")]
    WorktreeDeleted { worktree_id: Uuid, name: String },
    #[serde(rename = "heartbeat")]
    Heartbeat {
        now: DateTime<Utc>,
        uptime_secs: u64,
    },
}

impl Event {
    /// Short tag used for logging and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::PortOpened { .. } => "port:opened",
            Event::PortClosed { .. } => "port:closed",
            Event::GitDirty { .. } => "git:dirty",
            Event::GitClean { .. } => "git:clean",
            Event::ProcessStarted { .. } => "process:started",
            Event::ProcessStopped { .. } => "process:stopped",
            Event::ContainerStatus(_) => "container:status",
            Event::WorktreeStatusUpdated { .. } => "worktree:status_updated",
            Event::WorktreeBatchUpdated { .. } => "worktree:batch_updated",
            Event::WorktreeDirty { .. } => "worktree:dirty",
            Event::WorktreeClean { .. } => "worktree:clean",
            Event::WorktreeCreated { .. } => "worktree:created",
            Event::WorktreeDeleted { .. } => "worktree:deleted",
            Event::Heartbeat { .. } => "heartbeat",
        }
    }
}
