//! Relay of receiver speaking signals onto the voice event bus.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use voxbridge_core::types::{ChannelRef, SpeakingUpdate};

use crate::events::{VoiceEvent, VoiceEventBus};
use crate::platform::{SpeakingSignal, VoicePlatform};

/// Resolve display metadata for a speaking signal. Unknown members show their raw id.
pub fn resolve_speaking(
    platform: &dyn VoicePlatform,
    guild_id: &str,
    signal: &SpeakingSignal,
) -> SpeakingUpdate {
    match platform.member(guild_id, &signal.user_id) {
        Some(profile) => SpeakingUpdate {
            display_name: profile
                .display_name
                .unwrap_or_else(|| profile.username.clone()),
            id: profile.id,
            username: profile.username,
            speaking: signal.speaking,
        },
        None => SpeakingUpdate {
            id: signal.user_id.clone(),
            username: signal.user_id.clone(),
            display_name: signal.user_id.clone(),
            speaking: signal.speaking,
        },
    }
}

/// Forward every signal from `signals` to the bus, one event per signal,
/// until the receiver closes or `cancel` fires.
pub fn spawn_speaking_relay(
    platform: Arc<dyn VoicePlatform>,
    channel: ChannelRef,
    mut signals: broadcast::Receiver<SpeakingSignal>,
    bus: VoiceEventBus,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                received = signals.recv() => received,
            };
            match signal {
                Ok(signal) => {
                    let update = resolve_speaking(platform.as_ref(), &channel.guild_id, &signal);
                    bus.publish(VoiceEvent::Speaking {
                        channel: channel.clone(),
                        update,
                    });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%channel, skipped, "Speaking relay lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(%channel, "Speaking relay stopped");
    })
}
