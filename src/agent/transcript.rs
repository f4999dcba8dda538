//! Incremental parsing of agent transcript records.
//!
//! Transcripts are JSONL; records are treated as opaque maps and only the
//! fields the core reads are interpreted: `type`, `timestamp`, `cwd`,
//! `sessionId`, assistant text, `TodoWrite` tool calls, tool-result errors
//! and usage/cost metrics. A later todo-bearing record replaces the todo
//! set atomically.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::events::Todo;

/// Longest derived header before truncation.
const MAX_HEADER_LEN: usize = 80;

#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    pub session_id: Option<String>,
    pub cwd: Option<PathBuf>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub turn_count: u64,
    /// First summary record, falling back to the first user prompt.
    pub header: Option<String>,
    derived_header: bool,
    pub todos: Option<Vec<Todo>>,
    pub latest_assistant_message: Option<String>,
    pub latest_error: Option<String>,
    /// Whether the most recent of (assistant reply, tool error) was the
    /// error.
    pub last_was_error: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    /// Malformed lines seen so far.
    pub skipped: u64,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whichever came last between a normal assistant reply and a tool
    /// error report.
    pub fn latest_message_or_error(&self) -> Option<&str> {
        if self.last_was_error {
            self.latest_error.as_deref()
        } else {
            self.latest_assistant_message.as_deref()
        }
    }

    /// Parse one transcript line. Malformed lines are counted, not fatal.
    pub fn apply_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            self.skipped += 1;
            return;
        };
        self.apply_record(&record);
    }

    fn apply_record(&mut self, record: &Value) {
        if self.session_id.is_none() {
            if let Some(id) = record.get("sessionId").and_then(Value::as_str) {
                self.session_id = Some(id.to_string());
            }
        }
        if self.cwd.is_none() {
            if let Some(cwd) = record.get("cwd").and_then(Value::as_str) {
                self.cwd = Some(PathBuf::from(cwd));
            }
        }
        if let Some(ts) = record
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        {
            let ts = ts.with_timezone(&Utc);
            if self.first_timestamp.is_none() {
                self.first_timestamp = Some(ts);
            }
            self.last_timestamp = Some(ts);
        }

        if let Some(cost) = record.get("costUSD").and_then(Value::as_f64) {
            self.cost_usd = Some(self.cost_usd.unwrap_or(0.0) + cost);
        }
        if let Some(duration) = record.get("durationMs").and_then(Value::as_u64) {
            self.duration_ms = Some(duration);
        }

        match record.get("type").and_then(Value::as_str).unwrap_or("") {
            "summary" => {
                if let Some(summary) = record.get("summary").and_then(Value::as_str) {
                    if self.header.is_none() || self.derived_header {
                        self.header = Some(truncate(summary, MAX_HEADER_LEN));
                        self.derived_header = false;
                    }
                }
            }
            "user" => self.apply_user(record),
            "assistant" => self.apply_assistant(record),
            _ => {}
        }
    }

    fn apply_user(&mut self, record: &Value) {
        if record.get("isMeta").and_then(Value::as_bool) == Some(true) {
            return;
        }
        let Some(message) = record.get("message") else {
            return;
        };

        match message.get("content") {
            Some(Value::String(text)) => {
                self.turn_count += 1;
                if self.header.is_none() {
                    self.header = Some(truncate(text, MAX_HEADER_LEN));
                    self.derived_header = true;
                }
            }
            Some(Value::Array(items)) => {
                let mut was_prompt = false;
                for item in items {
                    match item.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            was_prompt = true;
                            if self.header.is_none() {
                                if let Some(text) = item.get("text").and_then(Value::as_str) {
                                    self.header = Some(truncate(text, MAX_HEADER_LEN));
                                    self.derived_header = true;
                                }
                            }
                        }
                        Some("tool_result") => {
                            if item.get("is_error").and_then(Value::as_bool) == Some(true) {
                                self.latest_error = Some(tool_result_text(item));
                                self.last_was_error = true;
                            }
                        }
                        _ => {}
                    }
                }
                if was_prompt {
                    self.turn_count += 1;
                }
            }
            _ => {}
        }
    }

    fn apply_assistant(&mut self, record: &Value) {
        let Some(message) = record.get("message") else {
            return;
        };

        if let Some(usage) = message.get("usage") {
            self.input_tokens += usage
                .get("input_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            self.output_tokens += usage
                .get("output_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0);
        }

        let Some(Value::Array(items)) = message.get("content") else {
            return;
        };
        let mut text_parts: Vec<&str> = Vec::new();
        for item in items {
            match item.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        text_parts.push(text);
                    }
                }
                Some("tool_use") => {
                    if item.get("name").and_then(Value::as_str) == Some("TodoWrite") {
                        if let Some(raw) = item.pointer("/input/todos") {
                            if let Ok(todos) = serde_json::from_value::<Vec<Todo>>(raw.clone()) {
                                self.todos = Some(todos);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        if !text_parts.is_empty() {
            self.latest_assistant_message = Some(text_parts.join("\n"));
            self.last_was_error = false;
        }
    }
}

fn tool_result_text(item: &Value) -> String {
    match item.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => "tool error".to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::TodoStatus;
    use pretty_assertions::assert_eq;

    fn user_line(text: &str, ts: &str) -> String {
        serde_json::json!({
            "type": "user",
            "sessionId": "sess-1",
            "cwd": "/workspace/catnip/muddy-cat",
            "timestamp": ts,
            "message": {"role": "user", "content": text}
        })
        .to_string()
    }

    fn assistant_line(text: &str, ts: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "sessionId": "sess-1",
            "timestamp": ts,
            "message": {
                "role": "assistant",
                "usage": {"input_tokens": 100, "output_tokens": 50},
                "content": [{"type": "text", "text": text}]
            }
        })
        .to_string()
    }

    #[test]
    fn test_basic_session_facts() {
        let mut acc = TranscriptAccumulator::new();
        acc.apply_line(&user_line("Fix the login bug", "2026-08-01T10:00:00Z"));
        acc.apply_line(&assistant_line("Looking at it now.", "2026-08-01T10:00:10Z"));
        acc.apply_line(&user_line("Also add tests", "2026-08-01T10:05:00Z"));
        acc.apply_line(&assistant_line("Done.", "2026-08-01T10:06:00Z"));

        assert_eq!(acc.session_id.as_deref(), Some("sess-1"));
        assert_eq!(acc.turn_count, 2);
        assert_eq!(acc.header.as_deref(), Some("Fix the login bug"));
        assert_eq!(acc.latest_assistant_message.as_deref(), Some("Done."));
        assert_eq!(acc.input_tokens, 200);
        assert_eq!(acc.output_tokens, 100);
        assert_eq!(
            acc.first_timestamp.unwrap().to_rfc3339(),
            "2026-08-01T10:00:00+00:00"
        );
        assert!(acc.last_timestamp > acc.first_timestamp);
    }

    #[test]
    fn test_summary_record_wins_header() {
        let mut acc = TranscriptAccumulator::new();
        acc.apply_line(&user_line("some prompt", "2026-08-01T10:00:00Z"));
        acc.apply_line(
            &serde_json::json!({"type": "summary", "summary": "Login flow rework"}).to_string(),
        );
        assert_eq!(acc.header.as_deref(), Some("Login flow rework"));
    }

    #[test]
    fn test_later_todo_set_replaces_earlier_atomically() {
        let todo_line = |todos: serde_json::Value| {
            serde_json::json!({
                "type": "assistant",
                "message": {"content": [
                    {"type": "tool_use", "name": "TodoWrite", "input": {"todos": todos}}
                ]}
            })
            .to_string()
        };

        let mut acc = TranscriptAccumulator::new();
        acc.apply_line(&todo_line(serde_json::json!([
            {"id": "1", "content": "first", "status": "pending", "priority": "low"},
            {"id": "2", "content": "second", "status": "pending", "priority": "high"}
        ])));
        acc.apply_line(&todo_line(serde_json::json!([
            {"id": "2", "content": "second", "status": "completed", "priority": "high"}
        ])));

        let todos = acc.todos.unwrap();
        assert_eq!(todos.len(), 1, "sets replace, never merge");
        assert_eq!(todos[0].id, "2");
        assert_eq!(todos[0].status, TodoStatus::Completed);
    }

    #[test]
    fn test_error_then_reply_ordering() {
        let error_line = serde_json::json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "is_error": true, "content": "command not found"}
            ]}
        })
        .to_string();

        let mut acc = TranscriptAccumulator::new();
        acc.apply_line(&assistant_line("first reply", "2026-08-01T10:00:00Z"));
        acc.apply_line(&error_line);
        assert_eq!(acc.latest_message_or_error(), Some("command not found"));

        acc.apply_line(&assistant_line("recovered", "2026-08-01T10:01:00Z"));
        assert_eq!(acc.latest_message_or_error(), Some("recovered"));
        assert_eq!(acc.latest_error.as_deref(), Some("command not found"));
    }

    #[test]
    fn test_malformed_lines_are_counted_not_fatal() {
        let mut acc = TranscriptAccumulator::new();
        acc.apply_line("not json at all {{{");
        acc.apply_line("");
        acc.apply_line(&user_line("still works", "2026-08-01T10:00:00Z"));
        assert_eq!(acc.skipped, 1);
        assert_eq!(acc.turn_count, 1);
    }

    #[test]
    fn test_meta_user_records_do_not_count_turns() {
        let mut acc = TranscriptAccumulator::new();
        acc.apply_line(
            &serde_json::json!({
                "type": "user",
                "isMeta": true,
                "message": {"content": "internal bookkeeping"}
            })
            .to_string(),
        );
        assert_eq!(acc.turn_count, 0);
        assert!(acc.header.is_none());
    }
}
