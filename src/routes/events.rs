//! Server-Sent Events stream of the bus.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, Sse};
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;

use crate::AppState;

/// One JSON event per `data:` line. The bus heartbeat keeps idle
/// connections alive; a consumer that falls a full bus capacity behind is
/// dropped (the stream ends) rather than stalling other subscribers.
pub async fn stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.bus.subscribe();

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(data) => return Some((Ok(SseEvent::default().data(data)), rx)),
                    Err(e) => {
                        tracing::error!("failed to serialize bus event: {e}");
                        continue;
                    }
                },
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("subscriber_dropped: SSE consumer lagged {n} events");
                    return None;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream)
}
