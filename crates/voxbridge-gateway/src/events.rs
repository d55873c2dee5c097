//! Event delivery to connected WebSocket clients.

use std::sync::Arc;

use tracing::{debug, error};

use voxbridge_core::protocol::ServerEvent;

use crate::signaling::Delivery;
use crate::state::GatewayState;

fn encode(event: &ServerEvent) -> Option<String> {
    match event.to_text() {
        Ok(text) => Some(text),
        Err(e) => {
            error!(event = event.name(), %e, "Failed to serialize event");
            None
        }
    }
}

/// Broadcast an event to all connected clients.
pub async fn broadcast_event(state: &Arc<GatewayState>, event: &ServerEvent) {
    let Some(msg) = encode(event) else {
        return;
    };

    let connections = state.connections.read().await;
    let mut sent = 0;
    for conn in connections.values() {
        if conn.event_tx.send(msg.clone()).is_ok() {
            sent += 1;
        }
    }
    debug!(event = event.name(), sent, "Broadcast event");
}

/// Send an event to one client. Returns false if the socket is gone.
pub async fn send_to(state: &Arc<GatewayState>, socket_id: &str, event: &ServerEvent) -> bool {
    let Some(msg) = encode(event) else {
        return false;
    };

    let connections = state.connections.read().await;
    let delivered = connections
        .get(socket_id)
        .is_some_and(|conn| conn.event_tx.send(msg).is_ok());
    if !delivered {
        debug!(event = event.name(), socket_id, "Target socket not connected");
    }
    delivered
}

/// Perform a signaling delivery, if any.
pub async fn deliver(state: &Arc<GatewayState>, delivery: Option<Delivery>) {
    if let Some(Delivery { to, event }) = delivery {
        send_to(state, &to, &event).await;
    }
}
