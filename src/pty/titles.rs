//! Persistent log of observed terminal titles.
//!
//! One line per event: `timestamp|pid|cwd|title`. The agent session index
//! consumes these events to drive nice-branch creation; the log file exists
//! so titles survive restarts.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TitleEvent {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub cwd: PathBuf,
    pub title: String,
}

impl TitleEvent {
    pub fn log_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.timestamp.to_rfc3339(),
            self.pid,
            self.cwd.display(),
            self.title
        )
    }
}

#[derive(Debug, Clone)]
pub struct TitleLog {
    path: PathBuf,
}

impl TitleLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, event: &TitleEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", event.log_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let log = TitleLog::new(dir.path().join("title_events.log"));

        let event = TitleEvent {
            timestamp: Utc::now(),
            pid: 1234,
            cwd: PathBuf::from("/workspace/catnip/muddy-cat"),
            title: "Implement login flow".into(),
        };
        log.append(&event).unwrap();
        log.append(&event).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("title_events.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("|1234|/workspace/catnip/muddy-cat|Implement login flow"));
    }
}
