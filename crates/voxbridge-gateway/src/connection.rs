//! WebSocket connection lifecycle: greeting, read/write loops, cleanup.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use voxbridge_core::protocol::{Hello, ServerEvent, SnapshotScope};
use voxbridge_voice::presence::snapshot_for;

use crate::events::deliver;
use crate::methods::dispatch_frame;
use crate::state::{ConnectionState, GatewayState};

/// The frames every client receives before anything else: `hello`, then one
/// unscoped `voiceMembers` snapshot.
fn greeting(state: &GatewayState, socket_id: &str) -> Vec<ServerEvent> {
    let members = snapshot_for(state.platform.as_ref(), &SnapshotScope::default());
    vec![
        ServerEvent::Hello(Hello {
            socket_id: socket_id.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
        ServerEvent::VoiceMembers(members),
    ]
}

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let socket_id = Uuid::new_v4().to_string();
    info!(socket_id = %socket_id, "New WebSocket connection");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();

    // Queue the greeting before registering so no broadcast can overtake it.
    for event in greeting(&state, &socket_id) {
        match event.to_text() {
            Ok(text) => {
                let _ = event_tx.send(text);
            }
            Err(e) => error!(socket_id = %socket_id, %e, "Failed to serialize greeting"),
        }
    }

    {
        let mut connections = state.connections.write().await;
        connections.insert(
            socket_id.clone(),
            ConnectionState {
                socket_id: socket_id.clone(),
                event_tx: event_tx.clone(),
                connected_at: Utc::now(),
            },
        );
    }
    drop(event_tx);

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = event_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                dispatch_frame(&state, &socket_id, text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                warn!(socket_id = %socket_id, "Ignoring binary frame");
            }
            Ok(Message::Close(_)) => {
                debug!(socket_id = %socket_id, "Client requested close");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(socket_id = %socket_id, %e, "WebSocket error");
                break;
            }
        }
    }

    send_task.abort();
    cleanup_connection(&state, &socket_id).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();

    info!(socket_id = %socket_id, "WebSocket connection closed");
}

/// Drop the outbound queue and release the socket's signaling role.
pub async fn cleanup_connection(state: &Arc<GatewayState>, socket_id: &str) {
    state.connections.write().await.remove(socket_id);
    let delivery = state.hub.lock().await.on_disconnect(socket_id);
    deliver(state, delivery).await;
}
