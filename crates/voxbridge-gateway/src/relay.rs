//! Background tasks that fan voice activity out to every client.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voxbridge_core::protocol::ServerEvent;
use voxbridge_voice::VoiceEvent;
use voxbridge_voice::presence::snapshot_for_update;

use crate::events::broadcast_event;
use crate::state::GatewayState;

/// Broadcast a fresh `voiceMembers` snapshot for every voice-state change.
pub fn spawn_presence_relay(state: Arc<GatewayState>, cancel: CancellationToken) -> JoinHandle<()> {
    let mut updates = state.platform.subscribe();
    tokio::spawn(async move {
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break,
                update = updates.recv() => update,
            };
            match update {
                Ok(event) => {
                    if let Some((channel, members)) =
                        snapshot_for_update(state.platform.as_ref(), &event)
                    {
                        debug!(%channel, members = members.len(), "Voice membership changed");
                        broadcast_event(&state, &ServerEvent::VoiceMembers(members)).await;
                        #[cfg(feature = "metrics")]
                        crate::metrics::record_broadcast(voxbridge_core::protocol::EVENT_VOICE_MEMBERS);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Presence relay lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Presence relay stopped");
    })
}

/// Broadcast speaking updates published by the voice link manager.
pub fn spawn_speaking_broadcast(
    state: Arc<GatewayState>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut events = state.voice.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(VoiceEvent::Speaking { update, .. }) => {
                    broadcast_event(&state, &ServerEvent::Speaking(update)).await;
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_broadcast(voxbridge_core::protocol::EVENT_SPEAKING);
                }
                Ok(VoiceEvent::LinkState { channel, state: link_state }) => {
                    debug!(%channel, state = %link_state, "Voice link state");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Speaking broadcast lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Speaking broadcast stopped");
    })
}
