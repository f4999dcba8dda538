//! Event system for real-time backend-to-client communication.
//!
//! Events flow from producers → [`EventBus`] → SSE subscribers:
//! - `EventBus`: in-memory broadcast channel for immediate distribution
//! - `Event`: the closed set of event types clients can observe
//! - a heartbeat task keeps idle SSE connections alive
//!
//! The bus has no persistence; a subscriber that needs a consistent view
//! re-reads the list endpoints after subscribing.

mod event_bus;
mod events;

pub use event_bus::EventBus;
pub use events::{ContainerStatus, Event, WorktreeStatusPatch};
