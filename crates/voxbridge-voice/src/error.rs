use std::time::Duration;

use thiserror::Error;

use voxbridge_core::types::{ChannelRef, GuildId, UserId};

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("voice link to {channel} not ready after {timeout:?}")]
    ConnectionTimeout {
        channel: ChannelRef,
        timeout: Duration,
    },

    #[error("voice link to {channel} did not recover from a disconnect")]
    TransientDisconnect { channel: ChannelRef },

    #[error("voice channel {0} not found")]
    ChannelNotFound(ChannelRef),

    #[error("user {user_id} is not in a voice channel of guild {guild_id}")]
    NotInVoice { guild_id: GuildId, user_id: UserId },

    #[error("voice link to {0} was closed before it became ready")]
    ConnectionClosed(ChannelRef),

    #[error("join of {0} was superseded by a newer join in the same guild")]
    Superseded(ChannelRef),

    #[error("platform error: {0}")]
    Platform(String),
}

impl VoiceError {
    /// Short machine-readable kind for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            VoiceError::ConnectionTimeout { .. } => "connection_timeout",
            VoiceError::TransientDisconnect { .. } => "transient_disconnect",
            VoiceError::ChannelNotFound(_) => "channel_not_found",
            VoiceError::NotInVoice { .. } => "not_in_voice",
            VoiceError::ConnectionClosed(_) => "connection_closed",
            VoiceError::Superseded(_) => "superseded",
            VoiceError::Platform(_) => "platform",
        }
    }
}
