//! Discovery and tailing of agent transcripts, per-worktree summaries and
//! activity tracking.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use notify::{RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::pty::TitleEvent;
use crate::worktree::{ActivityState, WorktreeManager};

use super::events::{AgentEvent, Todo};
use super::transcript::TranscriptAccumulator;

/// A worktree with a transcript record in this window counts as `active`.
const ACTIVITY_WINDOW_SECS: i64 = 300;

/// A prompt/tool hook in this window (and no `Stop` since) means `running`.
const RUNNING_WINDOW_SECS: i64 = 10;

/// Consecutive read failures before a transcript file is quarantined until
/// its mtime advances.
const QUARANTINE_THRESHOLD: u32 = 3;

/// Encoding the agent uses for project directories: the worktree path with
/// `/` replaced by `-` (e.g. `-workspace-catnip-muddy-cat`).
pub fn encode_worktree_path(path: &Path) -> String {
    path.to_string_lossy().replace('/', "-")
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub worktree_id: Uuid,
    pub worktree_name: String,
    pub worktree_path: PathBuf,
    pub session_start_time: Option<DateTime<Utc>>,
    /// None while the session is still active.
    pub session_end_time: Option<DateTime<Utc>>,
    pub turn_count: u64,
    pub is_active: bool,
    pub current_session_id: Option<String>,
    pub last_session_id: Option<String>,
    pub last_cost_usd: Option<f64>,
    pub last_duration_ms: Option<u64>,
    pub last_total_input_tokens: i64,
    pub last_total_output_tokens: i64,
    pub header: Option<String>,
    pub todos: Vec<Todo>,
    pub latest_assistant_message: Option<String>,
    pub latest_message_or_error: Option<String>,
    pub claude_activity_state: ActivityState,
}

struct TailState {
    offset: u64,
    /// Trailing partial line carried to the next read.
    remainder: Vec<u8>,
    acc: TranscriptAccumulator,
    error_streak: u32,
    quarantined_at: Option<SystemTime>,
}

impl TailState {
    fn new() -> Self {
        Self {
            offset: 0,
            remainder: Vec::new(),
            acc: TranscriptAccumulator::new(),
            error_streak: 0,
            quarantined_at: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct HookState {
    running_until: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    session_id: Option<String>,
}

// ---------------------------------------------------------------------------
// AgentSessionIndex
// ---------------------------------------------------------------------------

pub struct AgentSessionIndex {
    config: AppConfig,
    manager: Arc<WorktreeManager>,
    files: DashMap<PathBuf, TailState>,
    hooks: DashMap<PathBuf, HookState>,
    seen_titles: Mutex<HashSet<TitleEvent>>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
    fs_tx: mpsc::UnboundedSender<PathBuf>,
    fs_rx: Mutex<Option<mpsc::UnboundedReceiver<PathBuf>>>,
}

impl AgentSessionIndex {
    pub fn new(config: AppConfig, manager: Arc<WorktreeManager>) -> Arc<Self> {
        let (fs_tx, fs_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            manager,
            files: DashMap::new(),
            hooks: DashMap::new(),
            seen_titles: Mutex::new(HashSet::new()),
            watcher: Mutex::new(None),
            fs_tx,
            fs_rx: Mutex::new(Some(fs_rx)),
        })
    }

    /// Initial scan of the projects directory.
    pub fn bootstrap(&self) {
        let Ok(projects) = std::fs::read_dir(&self.config.claude_projects_dir) else {
            return;
        };
        for project in projects.flatten() {
            let dir = project.path();
            if !dir.is_dir() {
                continue;
            }
            let Ok(transcripts) = std::fs::read_dir(&dir) else {
                continue;
            };
            for transcript in transcripts.flatten() {
                let path = transcript.path();
                if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                    self.tail_file(&path);
                }
            }
        }
    }

    /// Spawn the watcher and the event loop consuming filesystem and title
    /// events.
    pub fn start(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
        mut title_rx: mpsc::UnboundedReceiver<TitleEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let _ = std::fs::create_dir_all(&self.config.claude_projects_dir);
        let tx = self.fs_tx.clone();
        match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                for path in event.paths {
                    if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                        let _ = tx.send(path);
                    }
                }
            }
        }) {
            Ok(mut watcher) => {
                if let Err(e) =
                    watcher.watch(&self.config.claude_projects_dir, RecursiveMode::Recursive)
                {
                    tracing::warn!("transcript watcher failed to start: {e}");
                } else {
                    *self.watcher.lock().expect("watcher mutex poisoned") = Some(watcher);
                }
            }
            Err(e) => tracing::warn!("transcript watcher unavailable: {e}"),
        }

        let index = self.clone();
        let mut rx = self
            .fs_rx
            .lock()
            .expect("fs rx mutex poisoned")
            .take()
            .expect("agent session index already started");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    path = rx.recv() => match path {
                        Some(path) => index.tail_file(&path),
                        None => break,
                    },
                    title = title_rx.recv() => match title {
                        Some(event) => index.handle_title(event).await,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Transcript tailing
    // -----------------------------------------------------------------------

    /// Read newly appended complete lines of one transcript into its
    /// accumulator.
    fn tail_file(&self, path: &Path) {
        // Take the state out of the map so no shard lock is held across the
        // file reads; single consumer, so no one else races the entry.
        let mut state = self
            .files
            .remove(path)
            .map(|(_, state)| state)
            .unwrap_or_else(TailState::new);

        Self::advance_tail(&mut state, path);
        self.files.insert(path.to_path_buf(), state);
    }

    fn advance_tail(state: &mut TailState, path: &Path) {
        if let Some(quarantined_at) = state.quarantined_at {
            let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
            match mtime {
                Some(mtime) if mtime > quarantined_at => {
                    state.quarantined_at = None;
                    state.error_streak = 0;
                }
                _ => return,
            }
        }

        let read = (|| -> std::io::Result<Vec<u8>> {
            let mut file = std::fs::File::open(path)?;
            file.seek(SeekFrom::Start(state.offset))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            Ok(buf)
        })();

        let buf = match read {
            Ok(buf) => buf,
            Err(e) => {
                state.error_streak += 1;
                if state.error_streak >= QUARANTINE_THRESHOLD {
                    tracing::warn!(
                        "quarantining transcript {} after repeated failures: {e}",
                        path.display()
                    );
                    state.quarantined_at =
                        std::fs::metadata(path).and_then(|m| m.modified()).ok();
                }
                return;
            }
        };
        state.error_streak = 0;
        state.offset += buf.len() as u64;

        let mut data = std::mem::take(&mut state.remainder);
        data.extend_from_slice(&buf);

        let mut start = 0;
        while let Some(nl) = data[start..].iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&data[start..start + nl]).to_string();
            state.acc.apply_line(&line);
            start += nl + 1;
        }
        state.remainder = data[start..].to_vec();
    }

    // -----------------------------------------------------------------------
    // Titles
    // -----------------------------------------------------------------------

    /// Route a terminal title to the worktree manager. Identical events are
    /// applied once, so log replays cause a single branch-mapping write.
    pub async fn handle_title(&self, event: TitleEvent) {
        {
            let mut seen = self.seen_titles.lock().expect("title set mutex poisoned");
            if !seen.insert(event.clone()) {
                return;
            }
        }
        let Some(worktree) = self.manager.find_by_path(&event.cwd) else {
            tracing::debug!("title for unknown worktree {}", event.cwd.display());
            return;
        };
        if let Err(e) = self
            .manager
            .apply_session_title(worktree.id, &event.title, event.timestamp)
            .await
        {
            tracing::warn!("failed to apply session title: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Hook events
    // -----------------------------------------------------------------------

    /// Apply a hook event. Returns false when the event carries no working
    /// directory (accepted but ignored).
    pub fn handle_event(&self, event: &AgentEvent) -> bool {
        let Some(dir) = event.working_directory.clone() else {
            return false;
        };
        let now = event.timestamp.unwrap_or_else(Utc::now);

        {
            let mut hook = self.hooks.entry(dir.clone()).or_default();
            match event.event_type.as_str() {
                "SessionStart" => {
                    *hook = HookState {
                        running_until: None,
                        stopped_at: None,
                        session_id: event.session_id.clone(),
                    };
                }
                "UserPromptSubmit" | "PostToolUse" => {
                    hook.running_until =
                        Some(now + ChronoDuration::seconds(RUNNING_WINDOW_SECS));
                    hook.stopped_at = None;
                    if hook.session_id.is_none() {
                        hook.session_id = event.session_id.clone();
                    }
                }
                "Stop" => {
                    hook.running_until = None;
                    hook.stopped_at = Some(now);
                }
                _ => {}
            }
        }

        if let Some(worktree) = self.manager.find_by_path(&dir) {
            self.manager
                .update_activity(worktree.id, self.activity_state(&dir));
            self.manager.touch(worktree.id);
        }
        true
    }

    /// `running` beats `active` beats `inactive`; computed from the hook
    /// window and the most recent transcript record.
    pub fn activity_state(&self, worktree_path: &Path) -> ActivityState {
        let now = Utc::now();
        if let Some(hook) = self.hooks.get(worktree_path) {
            if hook.running_until.is_some_and(|until| until > now) {
                return ActivityState::Running;
            }
        }

        let last_record = self.latest_record_time(worktree_path);
        match last_record {
            Some(ts) if now - ts < ChronoDuration::seconds(ACTIVITY_WINDOW_SECS) => {
                ActivityState::Active
            }
            _ => ActivityState::Inactive,
        }
    }

    fn latest_record_time(&self, worktree_path: &Path) -> Option<DateTime<Utc>> {
        let encoded = encode_worktree_path(worktree_path);
        self.files
            .iter()
            .filter(|entry| {
                entry
                    .key()
                    .parent()
                    .and_then(|d| d.file_name())
                    .and_then(|n| n.to_str())
                    == Some(encoded.as_str())
            })
            .filter_map(|entry| entry.value().acc.last_timestamp)
            .max()
    }

    // -----------------------------------------------------------------------
    // Summaries
    // -----------------------------------------------------------------------

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.manager
            .list_worktrees()
            .into_iter()
            .map(|wt| self.summarize(wt.id, &wt.name, &wt.path))
            .collect()
    }

    pub fn summary_for_slug(&self, slug: &str) -> Option<SessionSummary> {
        let worktree = self.manager.find_by_slug(slug)?;
        Some(self.summarize(worktree.id, &worktree.name, &worktree.path))
    }

    fn summarize(&self, id: Uuid, name: &str, path: &Path) -> SessionSummary {
        let encoded = encode_worktree_path(path);
        // Transcripts for this worktree, most recent last.
        let mut sessions: Vec<(Option<DateTime<Utc>>, PathBuf)> = self
            .files
            .iter()
            .filter(|entry| {
                entry
                    .key()
                    .parent()
                    .and_then(|d| d.file_name())
                    .and_then(|n| n.to_str())
                    == Some(encoded.as_str())
            })
            .map(|entry| (entry.value().acc.last_timestamp, entry.key().clone()))
            .collect();
        sessions.sort();

        let current_path = sessions.last().map(|(_, p)| p.clone());
        let previous_path = sessions
            .len()
            .checked_sub(2)
            .and_then(|i| sessions.get(i))
            .map(|(_, p)| p.clone());

        let activity = self.activity_state(path);
        let now = Utc::now();

        let mut summary = SessionSummary {
            worktree_id: id,
            worktree_name: name.to_string(),
            worktree_path: path.to_path_buf(),
            session_start_time: None,
            session_end_time: None,
            turn_count: 0,
            is_active: false,
            current_session_id: None,
            last_session_id: None,
            last_cost_usd: None,
            last_duration_ms: None,
            last_total_input_tokens: 0,
            last_total_output_tokens: 0,
            header: None,
            todos: Vec::new(),
            latest_assistant_message: None,
            latest_message_or_error: None,
            claude_activity_state: activity,
        };

        if let Some(previous_path) = previous_path {
            if let Some(entry) = self.files.get(&previous_path) {
                summary.last_session_id = entry.value().acc.session_id.clone();
            }
        }

        let Some(current_path) = current_path else {
            return summary;
        };
        let Some(entry) = self.files.get(&current_path) else {
            return summary;
        };
        let acc = &entry.value().acc;

        let stopped_since = self
            .hooks
            .get(path)
            .and_then(|h| h.stopped_at)
            .zip(acc.last_timestamp)
            .is_some_and(|(stopped, last)| stopped >= last);
        let is_active = acc
            .last_timestamp
            .is_some_and(|ts| now - ts < ChronoDuration::seconds(ACTIVITY_WINDOW_SECS))
            && !stopped_since;

        summary.session_start_time = acc.first_timestamp;
        summary.session_end_time = if is_active { None } else { acc.last_timestamp };
        summary.turn_count = acc.turn_count;
        summary.is_active = is_active;
        summary.current_session_id = acc.session_id.clone();
        summary.last_cost_usd = acc.cost_usd;
        summary.last_duration_ms = acc.duration_ms;
        summary.last_total_input_tokens = acc.input_tokens;
        summary.last_total_output_tokens = acc.output_tokens;
        summary.header = acc.header.clone();
        summary.todos = acc.todos.clone().unwrap_or_default();
        summary.latest_assistant_message = acc.latest_assistant_message.clone();
        summary.latest_message_or_error = acc.latest_message_or_error().map(String::from);
        summary
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::git::SystemGit;
    use crate::test_support::init_repo;

    #[test]
    fn test_encode_worktree_path() {
        assert_eq!(
            encode_worktree_path(Path::new("/workspace/catnip/muddy-cat")),
            "-workspace-catnip-muddy-cat"
        );
    }

    async fn setup() -> (tempfile::TempDir, Arc<WorktreeManager>, Arc<AgentSessionIndex>) {
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
        let manager = WorktreeManager::new(
            config.clone(),
            Arc::new(SystemGit::new()),
            Arc::new(EventBus::new()),
        );
        manager.bootstrap().await;
        let index = AgentSessionIndex::new(config, manager.clone());
        (root, manager, index)
    }

    fn write_transcript(
        projects_dir: &Path,
        worktree_path: &Path,
        session: &str,
        lines: &[String],
    ) -> PathBuf {
        let dir = projects_dir.join(encode_worktree_path(worktree_path));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join(format!("{session}.jsonl"));
        std::fs::write(&file, lines.join("\n") + "\n").unwrap();
        file
    }

    fn user_line(session: &str, cwd: &Path, text: &str, ts: DateTime<Utc>) -> String {
        serde_json::json!({
            "type": "user",
            "sessionId": session,
            "cwd": cwd.to_string_lossy(),
            "timestamp": ts.to_rfc3339(),
            "message": {"role": "user", "content": text}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_summary_from_transcript() {
        let (root, manager, index) = setup().await;
        let worktree = manager.checkout("local", "test-live-repo").await.unwrap();

        let now = Utc::now();
        let file = write_transcript(
            &root.path().join("projects"),
            &worktree.path,
            "11111111-2222-3333-4444-555555555555",
            &[
                user_line("11111111-2222-3333-4444-555555555555", &worktree.path, "Build the thing", now),
            ],
        );
        index.tail_file(&file);

        let summaries = index.summaries();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.worktree_id, worktree.id);
        assert_eq!(summary.turn_count, 1);
        assert_eq!(summary.header.as_deref(), Some("Build the thing"));
        assert!(summary.is_active, "recent record should be active");
        assert!(summary.session_end_time.is_none());
        assert_eq!(
            summary.current_session_id.as_deref(),
            Some("11111111-2222-3333-4444-555555555555")
        );
    }

    #[tokio::test]
    async fn test_incremental_tail_only_reads_appended_lines() {
        let (root, manager, index) = setup().await;
        let worktree = manager.checkout("local", "test-live-repo").await.unwrap();
        let now = Utc::now();

        let file = write_transcript(
            &root.path().join("projects"),
            &worktree.path,
            "sess",
            &[user_line("sess", &worktree.path, "first", now)],
        );
        index.tail_file(&file);

        // Append a second record and tail again.
        use std::io::Write;
        let mut handle = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
        writeln!(handle, "{}", user_line("sess", &worktree.path, "second", now)).unwrap();
        drop(handle);
        index.tail_file(&file);

        let summary = index.summary_for_slug(worktree.slug()).unwrap();
        assert_eq!(summary.turn_count, 2);
    }

    #[tokio::test]
    async fn test_hook_events_drive_activity_state() {
        let (_root, manager, index) = setup().await;
        let worktree = manager.checkout("local", "test-live-repo").await.unwrap();

        let prompt = AgentEvent {
            event_type: "UserPromptSubmit".into(),
            working_directory: Some(worktree.path.clone()),
            session_id: Some("sess".into()),
            agent_type: Some("claude".into()),
            data: Default::default(),
            timestamp: None,
        };
        assert!(index.handle_event(&prompt));
        assert_eq!(index.activity_state(&worktree.path), ActivityState::Running);
        assert_eq!(
            manager.get_worktree(worktree.id).unwrap().claude_activity_state,
            ActivityState::Running
        );

        let stop = AgentEvent {
            event_type: "Stop".into(),
            working_directory: Some(worktree.path.clone()),
            session_id: Some("sess".into()),
            agent_type: None,
            data: Default::default(),
            timestamp: None,
        };
        assert!(index.handle_event(&stop));
        assert_ne!(index.activity_state(&worktree.path), ActivityState::Running);
    }

    #[tokio::test]
    async fn test_event_without_working_directory_is_ignored() {
        let (_root, _manager, index) = setup().await;
        let event = AgentEvent {
            event_type: "UserPromptSubmit".into(),
            working_directory: None,
            session_id: None,
            agent_type: None,
            data: Default::default(),
            timestamp: None,
        };
        assert!(!index.handle_event(&event));
    }

    #[tokio::test]
    async fn test_duplicate_title_events_write_one_mapping() {
        let (_root, manager, index) = setup().await;
        let worktree = manager.checkout("local", "test-live-repo").await.unwrap();

        let event = TitleEvent {
            timestamp: Utc::now(),
            pid: 42,
            cwd: worktree.path.clone(),
            title: "Implement login flow".into(),
        };
        index.handle_title(event.clone()).await;
        index.handle_title(event).await;

        let updated = manager.get_worktree(worktree.id).unwrap();
        assert_eq!(updated.branch, "implement-login-flow");
        assert!(updated.session_title_history.is_empty());
    }
}
