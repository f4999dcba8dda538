//! Agent session index.
//!
//! Turns the on-disk transcripts the coding agent writes under
//! `~/.claude/projects/` into live per-worktree summaries, todo lists and
//! activity states, and routes hook events delivered over HTTP:
//! - `events`: hook payloads and todo items
//! - `transcript`: incremental JSONL record parsing
//! - `index`: discovery, tailing, summaries, activity tracking

mod events;
mod index;
mod transcript;

pub use events::{AgentEvent, Todo, TodoPriority, TodoStatus};
pub use index::{encode_worktree_path, AgentSessionIndex, SessionSummary};
pub use transcript::TranscriptAccumulator;
