use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use reelgen_core::types::BatchId;
use reelgen_events::FilteredReceiver;
use tokio::sync::broadcast::error::RecvError;

use crate::error::AppResult;
use crate::state::AppState;

/// Interval between keep-alive pings.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// GET /api/v1/batches/{id}/events
///
/// Upgrades to a WebSocket that streams every progress event of the batch
/// as a JSON text frame. Unknown batches get a 404 before the upgrade.
pub async fn batch_events_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> AppResult<impl IntoResponse> {
    state.service.get_batch_status(batch_id)?;
    let events = state.service.events().subscribe_batch(batch_id);
    Ok(ws.on_upgrade(move |socket| stream_events(socket, batch_id, events)))
}

/// Forward events until the client goes away or the bus closes.
///
/// Delivery is at-least-once from the consumer's point of view: a lagging
/// socket skips events and is told how many it missed.
async fn stream_events(socket: WebSocket, batch_id: BatchId, mut events: FilteredReceiver) {
    let conn_id = uuid::Uuid::new_v4();
    tracing::info!(%conn_id, %batch_id, "Progress WebSocket connected");

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));

    loop {
        tokio::select! {
            event = events.recv() => {
                let frame = match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(
                                %conn_id,
                                error = %e,
                                "Failed to encode progress event"
                            );
                            continue;
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(%conn_id, skipped, "Progress WebSocket lagged");
                        serde_json::json!({ "lagged": skipped }).to_string()
                    }
                    Err(RecvError::Closed) => break,
                };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    tracing::debug!(%conn_id, "WebSocket sink closed");
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Pong(_))) => tracing::trace!(%conn_id, "Pong received"),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(%conn_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!(%conn_id, %batch_id, "Progress WebSocket disconnected");
}
