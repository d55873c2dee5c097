//! Seams to the upstream voice platform.
//!
//! Lookups are synchronous reads of the platform client's cache, so callers
//! can make decisions (like join idempotency) before any suspension point.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use voxbridge_core::types::{ChannelId, ChannelRef, GuildId, UserId};

use crate::error::VoiceError;
use crate::player::AudioPlayer;
use crate::state::LinkState;

/// Identity of a guild member as cached by the platform client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberProfile {
    pub id: UserId,
    pub username: String,
    /// Guild-level display name (nickname or global name), if any.
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bot: bool,
}

/// A member currently connected to a voice channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupant {
    pub profile: MemberProfile,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Notifications pushed by the platform client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// A member's voice state changed (join, leave, move, mute, deafen).
    VoiceStateUpdate {
        guild_id: GuildId,
        user_id: UserId,
        old_channel_id: Option<ChannelId>,
        new_channel_id: Option<ChannelId>,
    },
}

/// Guild/channel/member lookups and voice-state notifications.
pub trait VoicePlatform: Send + Sync + 'static {
    /// Known guild ids, in cache order.
    fn guild_ids(&self) -> Vec<GuildId>;

    /// The voice channel the bot itself currently occupies in a guild.
    fn bot_voice_channel(&self, guild_id: &str) -> Option<ChannelId>;

    /// The voice channel a member currently occupies in a guild.
    fn member_voice_channel(&self, guild_id: &str, user_id: &str) -> Option<ChannelId>;

    /// Everyone connected to a channel, bots included. `None` if the channel is unknown.
    fn channel_occupants(&self, channel: &ChannelRef) -> Option<Vec<Occupant>>;

    /// Cached member profile.
    fn member(&self, guild_id: &str, user_id: &str) -> Option<MemberProfile>;

    /// Subscribe to platform notifications.
    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent>;
}

/// Parameters of a voice join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub channel: ChannelRef,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Raw speaking start/end signal from a link's audio receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakingSignal {
    pub user_id: UserId,
    pub speaking: bool,
}

/// A live (or establishing) voice connection.
pub trait VoiceConnection: Send + Sync + 'static {
    fn channel(&self) -> &ChannelRef;

    /// Watch the connection state.
    fn state(&self) -> watch::Receiver<LinkState>;

    /// Attach an audio player to the connection's transport.
    fn subscribe(&self, player: AudioPlayer);

    /// The audio receiver's speaking signals, if the receiver is available.
    fn speaking(&self) -> Option<broadcast::Receiver<SpeakingSignal>>;

    /// Leave the channel and move to `Destroyed`.
    fn destroy(&self);

    /// Stop driving the connection and move to `Destroyed` without leaving
    /// the channel. Used when a newer connection owns the guild's voice state.
    fn abandon(&self);
}

/// The voice-connection primitive.
#[async_trait]
pub trait VoiceConnector: Send + Sync + 'static {
    /// Start establishing a connection. Returns as soon as the join is issued;
    /// readiness is observed through [`VoiceConnection::state`].
    async fn connect(&self, request: JoinRequest) -> Result<Arc<dyn VoiceConnection>, VoiceError>;
}
