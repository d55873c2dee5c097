//! Inbound event handlers.

use std::sync::Arc;

use tracing::{debug, warn};

use voxbridge_core::protocol::{ClientEvent, Frame, ProtocolError, ServerEvent};
use voxbridge_voice::presence::snapshot_for;

use crate::events::{deliver, send_to};
use crate::state::GatewayState;

/// Decode a text frame and dispatch it. Bad frames are logged and dropped.
pub async fn dispatch_frame(state: &Arc<GatewayState>, socket_id: &str, text: &str) {
    let event = match Frame::parse(text).and_then(ClientEvent::decode) {
        Ok(event) => event,
        Err(ProtocolError::UnknownEvent(name)) => {
            debug!(socket_id, event = %name, "Ignoring unknown event");
            return;
        }
        Err(e) => {
            warn!(socket_id, error = %e, "Dropping malformed frame");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error("malformed_frame");
            return;
        }
    };

    #[cfg(feature = "metrics")]
    let (name, start) = (event.name(), std::time::Instant::now());

    dispatch_event(state, socket_id, event).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_event(name, start.elapsed().as_secs_f64());
}

/// Handle one decoded event from `socket_id`.
pub async fn dispatch_event(state: &Arc<GatewayState>, socket_id: &str, event: ClientEvent) {
    debug!(socket_id, event = event.name(), "Dispatching event");

    match event {
        ClientEvent::RegisterRole(registration) => {
            let delivery = state.hub.lock().await.register_role(
                socket_id,
                registration.role,
                registration.user_id,
            );
            deliver(state, delivery).await;
        }
        ClientEvent::WebrtcOffer(offer) => {
            let delivery = state
                .hub
                .lock()
                .await
                .route_offer(socket_id, offer.user_id, offer.sdp);
            deliver(state, delivery).await;
        }
        ClientEvent::WebrtcAnswer(answer) => {
            let delivery =
                state
                    .hub
                    .lock()
                    .await
                    .route_answer(answer.to_socket_id, answer.user_id, answer.sdp);
            deliver(state, Some(delivery)).await;
        }
        ClientEvent::WebrtcIceCandidate(candidate) => {
            let delivery = state
                .hub
                .lock()
                .await
                .route_ice_candidate(socket_id, candidate);
            deliver(state, delivery).await;
        }
        ClientEvent::RequestSnapshot(scope) => {
            let members = snapshot_for(state.platform.as_ref(), &scope);
            send_to(state, socket_id, &ServerEvent::VoiceMembers(members)).await;
        }
    }
}
