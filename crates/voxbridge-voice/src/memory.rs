//! In-process voice platform.
//!
//! Implements [`VoicePlatform`] and [`VoiceConnector`] over plain in-memory
//! state. Connection states are driven explicitly by the owner, which makes
//! it the platform used by tests across the workspace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use voxbridge_core::types::{ChannelId, ChannelRef, GuildId, UserId};

use crate::error::VoiceError;
use crate::platform::{
    JoinRequest, MemberProfile, Occupant, PlatformEvent, SpeakingSignal, VoiceConnection,
    VoiceConnector, VoicePlatform,
};
use crate::player::AudioPlayer;
use crate::state::LinkState;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct VoicePresence {
    user_id: UserId,
    channel_id: ChannelId,
    self_mute: bool,
    self_deaf: bool,
}

#[derive(Debug, Default)]
struct MemoryGuild {
    id: GuildId,
    channels: Vec<ChannelId>,
    members: HashMap<UserId, MemberProfile>,
    /// Voice presences in join order.
    voice: Vec<VoicePresence>,
}

/// In-memory guild/channel/member cache.
pub struct MemoryPlatform {
    bot_user_id: UserId,
    guilds: Mutex<Vec<MemoryGuild>>,
    events: broadcast::Sender<PlatformEvent>,
}

impl MemoryPlatform {
    pub fn new(bot_user_id: impl Into<UserId>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            bot_user_id: bot_user_id.into(),
            guilds: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    fn guilds(&self) -> MutexGuard<'_, Vec<MemoryGuild>> {
        self.guilds.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a guild; the bot is added as a member.
    pub fn add_guild(&self, guild_id: impl Into<GuildId>) {
        let guild_id = guild_id.into();
        let mut guilds = self.guilds();
        if guilds.iter().any(|g| g.id == guild_id) {
            return;
        }
        let mut guild = MemoryGuild {
            id: guild_id,
            ..Default::default()
        };
        guild.members.insert(
            self.bot_user_id.clone(),
            MemberProfile {
                id: self.bot_user_id.clone(),
                username: "voxbridge".into(),
                display_name: None,
                avatar_url: None,
                bot: true,
            },
        );
        guilds.push(guild);
    }

    pub fn add_channel(&self, guild_id: &str, channel_id: impl Into<ChannelId>) {
        let channel_id = channel_id.into();
        let mut guilds = self.guilds();
        if let Some(guild) = guilds.iter_mut().find(|g| g.id == guild_id) {
            if !guild.channels.contains(&channel_id) {
                guild.channels.push(channel_id);
            }
        }
    }

    pub fn add_member(&self, guild_id: &str, profile: MemberProfile) {
        let mut guilds = self.guilds();
        if let Some(guild) = guilds.iter_mut().find(|g| g.id == guild_id) {
            guild.members.insert(profile.id.clone(), profile);
        }
    }

    /// Move a member into a voice channel (or update their self state).
    pub fn join_voice(
        &self,
        guild_id: &str,
        user_id: &str,
        channel_id: &str,
        self_mute: bool,
        self_deaf: bool,
    ) {
        let old_channel_id = {
            let mut guilds = self.guilds();
            let Some(guild) = guilds.iter_mut().find(|g| g.id == guild_id) else {
                return;
            };
            match guild.voice.iter_mut().find(|v| v.user_id == user_id) {
                Some(presence) => {
                    let old = presence.channel_id.clone();
                    presence.channel_id = channel_id.to_string();
                    presence.self_mute = self_mute;
                    presence.self_deaf = self_deaf;
                    Some(old)
                }
                None => {
                    guild.voice.push(VoicePresence {
                        user_id: user_id.to_string(),
                        channel_id: channel_id.to_string(),
                        self_mute,
                        self_deaf,
                    });
                    None
                }
            }
        };

        let _ = self.events.send(PlatformEvent::VoiceStateUpdate {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            old_channel_id,
            new_channel_id: Some(channel_id.to_string()),
        });
    }

    /// Remove a member from voice.
    pub fn leave_voice(&self, guild_id: &str, user_id: &str) {
        let old_channel_id = {
            let mut guilds = self.guilds();
            let Some(guild) = guilds.iter_mut().find(|g| g.id == guild_id) else {
                return;
            };
            let Some(pos) = guild.voice.iter().position(|v| v.user_id == user_id) else {
                return;
            };
            guild.voice.remove(pos).channel_id
        };

        let _ = self.events.send(PlatformEvent::VoiceStateUpdate {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            old_channel_id: Some(old_channel_id),
            new_channel_id: None,
        });
    }
}

impl VoicePlatform for MemoryPlatform {
    fn guild_ids(&self) -> Vec<GuildId> {
        self.guilds().iter().map(|g| g.id.clone()).collect()
    }

    fn bot_voice_channel(&self, guild_id: &str) -> Option<ChannelId> {
        self.member_voice_channel(guild_id, &self.bot_user_id)
    }

    fn member_voice_channel(&self, guild_id: &str, user_id: &str) -> Option<ChannelId> {
        let guilds = self.guilds();
        let guild = guilds.iter().find(|g| g.id == guild_id)?;
        guild
            .voice
            .iter()
            .find(|v| v.user_id == user_id)
            .map(|v| v.channel_id.clone())
    }

    fn channel_occupants(&self, channel: &ChannelRef) -> Option<Vec<Occupant>> {
        let guilds = self.guilds();
        let guild = guilds.iter().find(|g| g.id == channel.guild_id)?;
        if !guild.channels.contains(&channel.channel_id) {
            return None;
        }
        let occupants = guild
            .voice
            .iter()
            .filter(|v| v.channel_id == channel.channel_id)
            .map(|v| Occupant {
                profile: guild.members.get(&v.user_id).cloned().unwrap_or_else(|| {
                    MemberProfile {
                        id: v.user_id.clone(),
                        username: v.user_id.clone(),
                        display_name: None,
                        avatar_url: None,
                        bot: false,
                    }
                }),
                self_mute: v.self_mute,
                self_deaf: v.self_deaf,
            })
            .collect();
        Some(occupants)
    }

    fn member(&self, guild_id: &str, user_id: &str) -> Option<MemberProfile> {
        let guilds = self.guilds();
        let guild = guilds.iter().find(|g| g.id == guild_id)?;
        guild.members.get(user_id).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.events.subscribe()
    }
}

/// How new in-memory connections behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectBehavior {
    /// Move straight to `Ready` on connect.
    pub auto_ready: bool,
    /// Whether connections expose an audio receiver.
    pub receiver: bool,
}

impl Default for ConnectBehavior {
    fn default() -> Self {
        Self {
            auto_ready: true,
            receiver: true,
        }
    }
}

/// Connector producing [`MemoryConnection`]s bound to a [`MemoryPlatform`].
pub struct MemoryConnector {
    platform: Arc<MemoryPlatform>,
    behavior: ConnectBehavior,
    connects: AtomicUsize,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
}

impl MemoryConnector {
    pub fn new(platform: Arc<MemoryPlatform>, behavior: ConnectBehavior) -> Self {
        Self {
            platform,
            behavior,
            connects: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Number of `connect` calls so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_connection(&self) -> Option<Arc<MemoryConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last()
            .cloned()
    }

    /// Every connection made so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl VoiceConnector for MemoryConnector {
    async fn connect(&self, request: JoinRequest) -> Result<Arc<dyn VoiceConnection>, VoiceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(MemoryConnection::new(
            self.platform.clone(),
            request,
            self.behavior.receiver,
        ));
        if self.behavior.auto_ready {
            connection.set_state(LinkState::Connecting);
            connection.set_state(LinkState::Ready);
        }
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(connection.clone());
        Ok(connection)
    }
}

/// Connection whose state is driven by [`MemoryConnection::set_state`].
pub struct MemoryConnection {
    platform: Arc<MemoryPlatform>,
    request: JoinRequest,
    state_tx: watch::Sender<LinkState>,
    speaking_tx: Option<broadcast::Sender<SpeakingSignal>>,
    players: Mutex<Vec<AudioPlayer>>,
    left: AtomicBool,
}

impl MemoryConnection {
    fn new(platform: Arc<MemoryPlatform>, request: JoinRequest, receiver: bool) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Signalling);
        let speaking_tx = receiver.then(|| broadcast::channel(EVENT_CAPACITY).0);
        Self {
            platform,
            request,
            state_tx,
            speaking_tx,
            players: Mutex::new(Vec::new()),
            left: AtomicBool::new(false),
        }
    }

    pub fn current_state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Whether this connection ever took the bot out of the guild's voice.
    pub fn sent_leave(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    /// Apply a transition if the table allows it. Ready puts the bot in the
    /// channel, Destroyed takes it out.
    pub fn set_state(&self, next: LinkState) -> bool {
        self.apply(next, true)
    }

    fn apply(&self, next: LinkState, leave: bool) -> bool {
        let changed = self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            let channel = &self.request.channel;
            match next {
                LinkState::Ready => self.platform.join_voice(
                    &channel.guild_id,
                    self.platform.bot_user_id(),
                    &channel.channel_id,
                    self.request.self_mute,
                    self.request.self_deaf,
                ),
                LinkState::Destroyed if leave => {
                    self.left.store(true, Ordering::SeqCst);
                    self.platform
                        .leave_voice(&channel.guild_id, self.platform.bot_user_id());
                }
                _ => {}
            }
        }
        changed
    }

    /// Emit a raw speaking signal from the receiver.
    pub fn emit_speaking(&self, user_id: &str, speaking: bool) {
        if let Some(tx) = &self.speaking_tx {
            let _ = tx.send(SpeakingSignal {
                user_id: user_id.to_string(),
                speaking,
            });
        }
    }

    pub fn player_count(&self) -> usize {
        self.players
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl VoiceConnection for MemoryConnection {
    fn channel(&self) -> &ChannelRef {
        &self.request.channel
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    fn subscribe(&self, player: AudioPlayer) {
        self.players
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(player);
    }

    fn speaking(&self) -> Option<broadcast::Receiver<SpeakingSignal>> {
        self.speaking_tx.as_ref().map(|tx| tx.subscribe())
    }

    fn destroy(&self) {
        self.set_state(LinkState::Destroyed);
    }

    fn abandon(&self) {
        self.apply(LinkState::Destroyed, false);
    }
}
