//! WebSocket attacher for PTY sessions.
//!
//! Binary frames carry raw terminal bytes in both directions (bracketed
//! paste therefore passes through verbatim). Text frames prefixed with
//! `ctl:` carry JSON control records; currently only `resize`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use crate::pty::{Attachment, ControlFrame};
use crate::{ApiError, AppState};

const CONTROL_PREFIX: &str = "ctl:";

#[derive(Debug, Deserialize)]
pub struct AttachParams {
    cols: Option<u16>,
    rows: Option<u16>,
}

pub async fn attach(
    ws: WebSocketUpgrade,
    Path(slug): Path<String>,
    Query(params): Query<AttachParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(worktree) = state.manager.find_by_slug(&slug) else {
        return ApiError::NotFound(format!("worktree {slug}")).into_response();
    };

    let cols = params.cols.unwrap_or(80).max(1);
    let rows = params.rows.unwrap_or(24).max(1);
    // Spawn failures are reported synchronously, before the upgrade.
    let attachment = match state.pty.attach(&slug, &worktree.path, cols, rows) {
        Ok(attachment) => attachment,
        Err(e) => return ApiError::Internal(e.to_string()).into_response(),
    };
    state.manager.touch(worktree.id);

    ws.on_upgrade(move |socket| handle_socket(socket, attachment))
}

async fn handle_socket(mut socket: WebSocket, mut attachment: Attachment) {
    // Replay the scrollback (or the pre-TUI prefix plus a repaint request)
    // before any live output.
    let replay = std::mem::take(&mut attachment.replay);
    if !replay.is_empty() && socket.send(Message::Binary(replay)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            chunk = attachment.output.recv() => match chunk {
                Ok(bytes) => {
                    if socket.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    // The sink is too slow; drop it, never the session.
                    tracing::warn!("dropping pty attacher {n} chunks behind");
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            control = attachment.control.recv() => match control {
                Ok(frame) => {
                    let Ok(json) = serde_json::to_string(&frame) else { continue };
                    if socket
                        .send(Message::Text(format!("{CONTROL_PREFIX}{json}")))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Binary(bytes))) => {
                    if attachment.write(&bytes).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if let Some(raw) = text.strip_prefix(CONTROL_PREFIX) {
                        match serde_json::from_str::<ControlFrame>(raw) {
                            Ok(ControlFrame::Resize { cols, rows }) => {
                                attachment.resize(cols.max(1), rows.max(1));
                            }
                            Err(e) => tracing::debug!("bad control frame: {e}"),
                        }
                    } else if attachment.write(text.as_bytes()).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
    // Dropping the attachment detaches the sink; the session lives on.
}
