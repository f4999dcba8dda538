use std::time::Instant;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::config::{BUS_CAPACITY, HEARTBEAT_INTERVAL};

use super::Event;

pub struct EventBus {
    tx: broadcast::Sender<Event>,
    started_at: Instant,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            started_at: Instant::now(),
        }
    }

    /// Non-blocking publish. Delivery is best-effort per subscriber; having
    /// no subscribers is not an error.
    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            tracing::trace!("event {kind} emitted with no subscribers");
        }
    }

    /// Get a new receiver for this bus. A receiver that falls more than the
    /// channel capacity behind sees `RecvError::Lagged`; its consumer is
    /// expected to drop the subscription (see the SSE handler).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Spawn the heartbeat task. Runs until `shutdown` flips.
    pub fn start_heartbeat(
        self: &std::sync::Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        bus.emit(Event::Heartbeat {
                            now: Utc::now(),
                            uptime_secs: bus.uptime_secs(),
                        });
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(Event::PortOpened { port: 3000 });
        bus.emit(Event::PortClosed { port: 3000 });

        assert_eq!(rx.recv().await.unwrap().kind(), "port:opened");
        assert_eq!(rx.recv().await.unwrap().kind(), "port:closed");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(Event::PortOpened { port: 1 });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_observes_lag() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for port in 0..(BUS_CAPACITY + 16) {
            bus.emit(Event::PortOpened { port: port as u16 });
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 16),
            other => panic!("expected lag, got {other:?}"),
        }
    }
}
