//! PTY session lifecycle and multi-attacher plumbing.
//!
//! A session is created on first attach and keyed by the worktree slug. A
//! dedicated reader thread drains the PTY into the scrollback buffer,
//! watches for alternate-screen and title sequences, and broadcasts each
//! chunk to every attached sink. The session outlives its attachers and is
//! reaped only when the child exits or the worktree is deleted.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use dashmap::DashMap;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::bus::{Event, EventBus};
use crate::config::{AppConfig, PTY_SCROLLBACK_BYTES};
use crate::worktree::SessionStopper;

use super::buffer::{AnsiScanner, ReplayBuffer, ScanEvent};
use super::titles::{TitleEvent, TitleLog};

/// Buffered output chunks per attacher before it is considered too slow and
/// dropped (the session itself is unaffected).
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to spawn session: {0}")]
    Spawn(String),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} has exited")]
    Exited(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// In-band control frames sent alongside raw terminal bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Resize { cols: u16, rows: u16 },
}

// ---------------------------------------------------------------------------
// PtySession
// ---------------------------------------------------------------------------

struct SessionInner {
    buffer: ReplayBuffer,
    scanner: AnsiScanner,
    attacher_sizes: HashMap<u64, (u16, u16)>,
    next_attach_id: u64,
    applied_size: Option<(u16, u16)>,
    last_activity: chrono::DateTime<Utc>,
}

pub struct PtySession {
    slug: String,
    cwd: PathBuf,
    pid: Option<u32>,
    inner: Mutex<SessionInner>,
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    control_tx: broadcast::Sender<ControlFrame>,
    exited: AtomicBool,
}

impl PtySession {
    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Absolute end offset of the scrollback; tests poll this to know output
    /// has landed.
    pub fn buffered_bytes(&self) -> u64 {
        self.inner
            .lock()
            .expect("session state mutex poisoned")
            .buffer
            .end_offset()
    }

    pub fn last_activity(&self) -> chrono::DateTime<Utc> {
        self.inner
            .lock()
            .expect("session state mutex poisoned")
            .last_activity
    }

    /// Serialized write into the PTY. Callers hold an attachment.
    pub fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().expect("session writer mutex poisoned");
        writer.write_all(bytes)?;
        writer.flush()
    }

    fn attach_sink(&self, cols: u16, rows: u16) -> (Vec<u8>, broadcast::Receiver<Vec<u8>>, u64) {
        let mut inner = self.inner.lock().expect("session state mutex poisoned");
        let attach_id = inner.next_attach_id;
        inner.next_attach_id += 1;
        inner.attacher_sizes.insert(attach_id, (cols, rows));
        // Snapshot and subscribe under the same lock the reader appends
        // under, so no chunk is replayed and also delivered live.
        let replay = inner.buffer.replay();
        let rx = self.output_tx.subscribe();
        drop(inner);

        self.apply_min_size();
        (replay, rx, attach_id)
    }

    fn detach_sink(&self, attach_id: u64) {
        let mut inner = self.inner.lock().expect("session state mutex poisoned");
        inner.attacher_sizes.remove(&attach_id);
        drop(inner);
        self.apply_min_size();
    }

    fn resize_attacher(&self, attach_id: u64, cols: u16, rows: u16) {
        let mut inner = self.inner.lock().expect("session state mutex poisoned");
        inner.attacher_sizes.insert(attach_id, (cols, rows));
        drop(inner);
        self.apply_min_size();
    }

    /// Apply the smallest dimensions across attachers so everyone can
    /// render, announcing the change on the control channel.
    fn apply_min_size(&self) {
        let target = {
            let mut inner = self.inner.lock().expect("session state mutex poisoned");
            let min = inner
                .attacher_sizes
                .values()
                .copied()
                .reduce(|(c1, r1), (c2, r2)| (c1.min(c2), r1.min(r2)));
            match min {
                Some(size) if inner.applied_size != Some(size) => {
                    inner.applied_size = Some(size);
                    Some(size)
                }
                _ => None,
            }
        };

        if let Some((cols, rows)) = target {
            let master = self.master.lock().expect("session master mutex poisoned");
            if let Err(e) = master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            }) {
                tracing::warn!("resize of session {} failed: {e}", self.slug);
            }
            let _ = self.control_tx.send(ControlFrame::Resize { cols, rows });
        }
    }

    #[cfg(test)]
    fn applied_size(&self) -> Option<(u16, u16)> {
        self.inner
            .lock()
            .expect("session state mutex poisoned")
            .applied_size
    }

    fn kill(&self) {
        let mut child = self.child.lock().expect("session child mutex poisoned");
        if let Err(e) = child.kill() {
            tracing::debug!("kill of session {} child: {e}", self.slug);
        }
    }
}

/// A live attachment to a session. Dropping it detaches the sink; the
/// session keeps running with zero attachers.
pub struct Attachment {
    session: Arc<PtySession>,
    attach_id: u64,
    pub replay: Vec<u8>,
    pub output: broadcast::Receiver<Vec<u8>>,
    pub control: broadcast::Receiver<ControlFrame>,
}

impl Attachment {
    pub fn session(&self) -> &Arc<PtySession> {
        &self.session
    }

    pub fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.session.write(bytes)
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        self.session.resize_attacher(self.attach_id, cols, rows);
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.session.detach_sink(self.attach_id);
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

pub struct SessionManager {
    config: AppConfig,
    bus: Arc<EventBus>,
    sessions: DashMap<String, Arc<PtySession>>,
    title_tx: mpsc::UnboundedSender<TitleEvent>,
    title_log: TitleLog,
}

impl SessionManager {
    pub fn new(
        config: AppConfig,
        bus: Arc<EventBus>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TitleEvent>) {
        let (title_tx, title_rx) = mpsc::unbounded_channel();
        let title_log = TitleLog::new(config.title_log_path());
        (
            Arc::new(Self {
                config,
                bus,
                sessions: DashMap::new(),
                title_tx,
                title_log,
            }),
            title_rx,
        )
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn get(&self, slug: &str) -> Option<Arc<PtySession>> {
        self.sessions.get(slug).map(|entry| entry.value().clone())
    }

    /// Attach to the session for `slug`, creating it (with the configured
    /// command, cwd and the client's window size) if none is running. Spawn
    /// failures surface synchronously.
    pub fn attach(
        self: &Arc<Self>,
        slug: &str,
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<Attachment, PtyError> {
        // Clone out of the map first so no shard lock is held across the
        // remove/insert below.
        let existing = self.sessions.get(slug).map(|entry| entry.value().clone());
        let session = match existing {
            Some(existing) if !existing.has_exited() => existing,
            _ => {
                self.sessions.remove(slug);
                let session = self.spawn_session(slug, cwd, cols, rows)?;
                self.sessions.insert(slug.to_string(), session.clone());
                session
            }
        };

        let (replay, output, attach_id) = session.attach_sink(cols, rows);
        let control = session.control_tx.subscribe();
        Ok(Attachment {
            session,
            attach_id,
            replay,
            output,
            control,
        })
    }

    fn spawn_session(
        self: &Arc<Self>,
        slug: &str,
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<PtySession>, PtyError> {
        let pty_system = portable_pty::native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn(format!("openpty failed: {e}")))?;

        let mut parts = self.config.session_command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| PtyError::Spawn("empty session command".into()))?;
        let mut command = CommandBuilder::new(program);
        for arg in parts {
            command.arg(arg);
        }
        command.cwd(cwd);
        command.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| PtyError::Spawn(format!("spawn of {program} failed: {e}")))?;
        drop(pair.slave);
        let pid = child.process_id();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(format!("pty writer unavailable: {e}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(format!("pty reader unavailable: {e}")))?;

        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (control_tx, _) = broadcast::channel(16);

        let session = Arc::new(PtySession {
            slug: slug.to_string(),
            cwd: cwd.to_path_buf(),
            pid,
            inner: Mutex::new(SessionInner {
                buffer: ReplayBuffer::new(PTY_SCROLLBACK_BYTES),
                scanner: AnsiScanner::new(),
                attacher_sizes: HashMap::new(),
                next_attach_id: 0,
                applied_size: Some((cols, rows)),
                last_activity: Utc::now(),
            }),
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            output_tx,
            control_tx,
            exited: AtomicBool::new(false),
        });

        self.bus.emit(Event::ProcessStarted {
            session_id: slug.to_string(),
            pid: pid.unwrap_or(0),
        });

        self.start_reader(session.clone(), reader);
        Ok(session)
    }

    /// The single reader loop: drain PTY output into the scrollback, scan
    /// for escape sequences, broadcast each chunk in arrival order.
    fn start_reader(self: &Arc<Self>, session: Arc<PtySession>, mut reader: Box<dyn Read + Send>) {
        let manager: Weak<SessionManager> = Arc::downgrade(self);
        let bus = self.bus.clone();
        let title_tx = self.title_tx.clone();
        let title_log = self.title_log.clone();

        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let chunk = &buf[..n];

                let mut titles = Vec::new();
                {
                    let mut inner = session.inner.lock().expect("session state mutex poisoned");
                    let base = inner.buffer.end_offset();
                    let events = inner.scanner.scan(base, chunk);
                    inner.buffer.push(chunk);
                    for event in events {
                        match event {
                            ScanEvent::AltScreenEnter(at) => inner.buffer.enter_alt_screen(at),
                            ScanEvent::AltScreenExit => inner.buffer.exit_alt_screen(),
                            ScanEvent::Title(title) => titles.push(title),
                        }
                    }
                    inner.last_activity = Utc::now();
                    // Broadcast under the lock so attach snapshots never
                    // race a chunk into both replay and live delivery.
                    let _ = session.output_tx.send(chunk.to_vec());
                }

                for title in titles {
                    let event = TitleEvent {
                        timestamp: Utc::now(),
                        pid: session.pid.unwrap_or(0),
                        cwd: session.cwd.clone(),
                        title,
                    };
                    if let Err(e) = title_log.append(&event) {
                        tracing::warn!("title log append failed: {e}");
                    }
                    let _ = title_tx.send(event);
                }
            }

            session.exited.store(true, Ordering::SeqCst);
            let exit_code = session
                .child
                .lock()
                .expect("session child mutex poisoned")
                .try_wait()
                .ok()
                .flatten()
                .map(|status| status.exit_code() as i32);
            bus.emit(Event::ProcessStopped {
                session_id: session.slug.clone(),
                exit_code,
            });
            if let Some(manager) = manager.upgrade() {
                manager
                    .sessions
                    .remove_if(&session.slug, |_, stored| Arc::ptr_eq(stored, &session));
            }
            tracing::info!("pty session {} ended", session.slug);
        });
    }

    /// Kill the session for a worktree (used on worktree deletion and
    /// shutdown). Removal from the registry happens when the reader loop
    /// observes EOF.
    pub fn stop(&self, slug: &str) {
        if let Some(session) = self.get(slug) {
            session.kill();
        }
    }

    pub fn shutdown_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().kill();
        }
    }
}

impl SessionStopper for SessionManager {
    fn stop(&self, slug: &str) {
        SessionManager::stop(self, slug);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(root: &Path, command: &str) -> AppConfig {
        AppConfig {
            workspace_root: root.join("workspace"),
            live_dir: root.join("live"),
            state_dir: root.join("state"),
            claude_projects_dir: root.join("projects"),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            session_command: command.to_string(),
        }
    }

    /// Write an executable script and return the command line that runs it.
    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    async fn wait_until(session: &Arc<PtySession>, min_bytes: u64) {
        for _ in 0..200 {
            if session.buffered_bytes() >= min_bytes {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!(
            "session produced only {} bytes, wanted {min_bytes}",
            session.buffered_bytes()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_attach_spawns_and_replays_scrollback() {
        let dir = tempfile::tempdir().unwrap();
        let command = script(dir.path(), "hello.sh", "printf 'hello from pty'; sleep 30");
        let (manager, _titles) = SessionManager::new(test_config(dir.path(), &command), Arc::new(EventBus::new()));

        let first = manager.attach("muddy-cat", dir.path(), 80, 24).unwrap();
        wait_until(first.session(), 14).await;

        let second = manager.attach("muddy-cat", dir.path(), 80, 24).unwrap();
        assert_eq!(second.replay, b"hello from pty");
        assert_eq!(manager.session_count(), 1, "both attachers share one session");

        manager.stop("muddy-cat");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tui_replay_stops_at_entry_marker() {
        let dir = tempfile::tempdir().unwrap();
        let command = script(
            dir.path(),
            "tui.sh",
            "printf 'ordinary'; printf '\\033[?1049h'; printf 'TUIFRAME'; sleep 30",
        );
        let (manager, _titles) = SessionManager::new(test_config(dir.path(), &command), Arc::new(EventBus::new()));

        let first = manager.attach("tui-wt", dir.path(), 80, 24).unwrap();
        // ordinary(8) + ESC sequence(8) + TUIFRAME(8)
        wait_until(first.session(), 24).await;

        let second = manager.attach("tui-wt", dir.path(), 80, 24).unwrap();
        assert_eq!(&second.replay[..8], b"ordinary");
        assert_eq!(second.replay[8], 0x0c);
        assert_eq!(second.replay.len(), 9, "TUI frame must not be duplicated");

        manager.stop("tui-wt");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_title_events_reach_consumer_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let command = script(
            dir.path(),
            "title.sh",
            "printf '\\033]0;Implement login flow\\007'; sleep 30",
        );
        let config = test_config(dir.path(), &command);
        let title_log_path = config.title_log_path();
        let (manager, mut titles) = SessionManager::new(config, Arc::new(EventBus::new()));

        let _attachment = manager.attach("title-wt", dir.path(), 80, 24).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), titles.recv())
            .await
            .expect("timed out waiting for title")
            .expect("title channel closed");
        assert_eq!(event.title, "Implement login flow");
        assert_eq!(event.cwd, dir.path());

        let logged = std::fs::read_to_string(title_log_path).unwrap();
        assert!(logged.contains("|Implement login flow"));

        manager.stop("title-wt");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_reaches_child() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _titles) =
            SessionManager::new(test_config(dir.path(), "cat"), Arc::new(EventBus::new()));

        let attachment = manager.attach("cat-wt", dir.path(), 80, 24).unwrap();
        attachment.write(b"ping\r").unwrap();
        wait_until(attachment.session(), 4).await;

        let replay = manager
            .attach("cat-wt", dir.path(), 80, 24)
            .unwrap()
            .replay
            .clone();
        let text = String::from_utf8_lossy(&replay).to_string();
        assert!(text.contains("ping"), "echoed input missing: {text:?}");

        manager.stop("cat-wt");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_smallest_attacher_dimensions_win() {
        let dir = tempfile::tempdir().unwrap();
        let command = script(dir.path(), "sleep.sh", "sleep 30");
        let (manager, _titles) = SessionManager::new(test_config(dir.path(), &command), Arc::new(EventBus::new()));

        let big = manager.attach("size-wt", dir.path(), 120, 40).unwrap();
        let small = manager.attach("size-wt", dir.path(), 80, 24).unwrap();
        assert_eq!(big.session().applied_size(), Some((80, 24)));

        drop(small);
        big.resize(120, 40);
        assert_eq!(big.session().applied_size(), Some((120, 40)));

        manager.stop("size-wt");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _titles) = SessionManager::new(
            test_config(dir.path(), "/nonexistent/binary-xyz"),
            Arc::new(EventBus::new()),
        );
        match manager.attach("bad-wt", dir.path(), 80, 24) {
            Err(PtyError::Spawn(_)) => {}
            other => panic!("expected spawn error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(manager.session_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_exit_emits_process_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let command = script(dir.path(), "quick.sh", "printf done");
        let bus = Arc::new(EventBus::new());
        let (manager, _titles) = SessionManager::new(test_config(dir.path(), &command), bus.clone());

        let mut rx = bus.subscribe();
        let _attachment = manager.attach("quick-wt", dir.path(), 80, 24).unwrap();

        let mut saw_started = false;
        let mut saw_stopped = false;
        for _ in 0..4 {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(Event::ProcessStarted { session_id, .. })) if session_id == "quick-wt" => {
                    saw_started = true;
                }
                Ok(Ok(Event::ProcessStopped { session_id, .. })) if session_id == "quick-wt" => {
                    saw_stopped = true;
                    break;
                }
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert!(saw_started && saw_stopped);
    }
}
