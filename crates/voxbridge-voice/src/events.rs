//! Publish/subscribe bus between the voice layer and the transport.

use tokio::sync::broadcast;

use voxbridge_core::types::{ChannelRef, SpeakingUpdate};

use crate::state::LinkState;

/// Broadcast capacity. A subscriber that falls behind by more than this
/// many events skips ahead (lagged).
const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    /// A resolved speaking start/end for a member of a linked channel.
    Speaking {
        channel: ChannelRef,
        update: SpeakingUpdate,
    },
    /// A voice link moved to a new state.
    LinkState {
        channel: ChannelRef,
        state: LinkState,
    },
}

/// Cloneable handle; clones share the same channel.
#[derive(Clone)]
pub struct VoiceEventBus {
    tx: broadcast::Sender<VoiceEvent>,
}

impl VoiceEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Non-blocking. No-op if nobody is subscribed.
    pub fn publish(&self, event: VoiceEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.tx.subscribe()
    }
}

impl Default for VoiceEventBus {
    fn default() -> Self {
        Self::new()
    }
}
