//! WebSocket streaming endpoint for execution events

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventFilter {
    /// Only stream events for this indicator
    pub indicator_id: Option<i64>,
}

/// GET /api/v1/events/ws?indicator_id=
///
/// Upgrades connection to WebSocket for real-time execution events.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter.indicator_id))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState, indicator_filter: Option<i64>) {
    info!(indicator_id = ?indicator_filter, "WebSocket client connected");
    state.metrics.inc_ws_connections();

    let (mut sender, mut receiver) = socket.split();
    let mut broadcast_rx = state.broadcast_tx.subscribe();

    // Task to send events to client
    let mut send_task = tokio::spawn(async move {
        loop {
            match broadcast_rx.recv().await {
                Ok(event) => {
                    if indicator_filter.is_some_and(|id| id != event.indicator_id()) {
                        continue;
                    }

                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!(error = %e, "Failed to serialize event");
                            continue;
                        }
                    };

                    if sender.send(Message::Text(json.into())).await.is_err() {
                        // Client disconnected
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(lagged = count, "Broadcast receiver lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    });

    // Task to receive close frames from client (keep-alive)
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Ok(_) => {} // Pings are answered by axum; other messages ignored
                Err(_) => break,
            }
        }
    });

    // Whichever side finishes first ends the session
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.metrics.dec_ws_connections();
    info!(indicator_id = ?indicator_filter, "WebSocket client disconnected");
}
