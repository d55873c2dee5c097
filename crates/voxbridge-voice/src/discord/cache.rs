//! Guild/channel/member/voice-state cache fed by gateway dispatches.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::debug;

use voxbridge_core::types::{ChannelId, ChannelRef, GuildId, UserId};

use super::model::{Channel, GuildCreate, GuildMember, Ready, VoiceState};
use crate::platform::{MemberProfile, Occupant, PlatformEvent, VoicePlatform};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct CachedVoiceState {
    user_id: UserId,
    channel_id: ChannelId,
    self_mute: bool,
    self_deaf: bool,
}

#[derive(Debug, Default)]
struct CachedGuild {
    id: GuildId,
    voice_channels: Vec<ChannelId>,
    members: HashMap<UserId, MemberProfile>,
    voice_states: Vec<CachedVoiceState>,
}

#[derive(Debug, Default)]
struct CacheState {
    bot_user_id: Option<UserId>,
    guilds: Vec<CachedGuild>,
    /// Guilds announced by READY that have not sent GUILD_CREATE yet.
    pending: HashSet<GuildId>,
}

impl CacheState {
    fn guild_mut(&mut self, guild_id: &str) -> Option<&mut CachedGuild> {
        self.guilds.iter_mut().find(|g| g.id == guild_id)
    }

    fn guild(&self, guild_id: &str) -> Option<&CachedGuild> {
        self.guilds.iter().find(|g| g.id == guild_id)
    }
}

/// [`VoicePlatform`] backed by gateway state.
pub struct GuildCache {
    state: Mutex<CacheState>,
    events: broadcast::Sender<PlatformEvent>,
    ready: watch::Sender<bool>,
}

impl GuildCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ready, _) = watch::channel(false);
        Self {
            state: Mutex::new(CacheState::default()),
            events,
            ready,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn bot_user_id(&self) -> Option<UserId> {
        self.lock().bot_user_id.clone()
    }

    /// Becomes true once READY arrived and every announced guild was loaded.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Wait for [`GuildCache::ready`], at most `timeout`. Returns whether it fired.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.ready();
        matches!(
            tokio::time::timeout(timeout, ready.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        )
    }

    fn update_ready(&self, state: &CacheState) {
        let ready = state.bot_user_id.is_some() && state.pending.is_empty();
        self.ready.send_if_modified(|current| {
            let changed = *current != ready;
            *current = ready;
            changed
        });
    }

    /// A new session starts from scratch: guilds are re-sent after READY.
    pub fn apply_ready(&self, ready: &Ready) {
        let mut state = self.lock();
        state.bot_user_id = Some(ready.user.id.clone());
        state.guilds.clear();
        state.pending = ready.guilds.iter().map(|g| g.id.clone()).collect();
        self.update_ready(&state);
    }

    pub fn apply_guild_create(&self, guild: GuildCreate) {
        if guild.unavailable {
            return;
        }
        let mut state = self.lock();
        let mut cached = CachedGuild {
            id: guild.id.clone(),
            ..Default::default()
        };
        cached.voice_channels = guild
            .channels
            .iter()
            .filter(|c| c.is_voice())
            .map(|c| c.id.clone())
            .collect();
        for member in &guild.members {
            if let Some(profile) = member.to_profile() {
                cached.members.insert(profile.id.clone(), profile);
            }
        }
        for voice in &guild.voice_states {
            if let Some(member) = voice.member.as_ref().and_then(GuildMember::to_profile) {
                cached.members.insert(member.id.clone(), member);
            }
            if let Some(channel_id) = &voice.channel_id {
                cached.voice_states.push(CachedVoiceState {
                    user_id: voice.user_id.clone(),
                    channel_id: channel_id.clone(),
                    self_mute: voice.self_mute,
                    self_deaf: voice.self_deaf,
                });
            }
        }
        debug!(
            guild_id = %guild.id,
            voice_channels = cached.voice_channels.len(),
            members = cached.members.len(),
            "Guild cached"
        );

        match state.guilds.iter().position(|g| g.id == guild.id) {
            Some(pos) => state.guilds[pos] = cached,
            None => state.guilds.push(cached),
        }
        state.pending.remove(&guild.id);
        self.update_ready(&state);
    }

    pub fn apply_guild_delete(&self, guild_id: &str) {
        let mut state = self.lock();
        state.guilds.retain(|g| g.id != guild_id);
        state.pending.remove(guild_id);
        self.update_ready(&state);
    }

    pub fn apply_channel_upsert(&self, channel: &Channel) {
        let Some(guild_id) = &channel.guild_id else {
            return;
        };
        let mut state = self.lock();
        let Some(guild) = state.guild_mut(guild_id) else {
            return;
        };
        let known = guild.voice_channels.contains(&channel.id);
        if channel.is_voice() && !known {
            guild.voice_channels.push(channel.id.clone());
        } else if !channel.is_voice() && known {
            guild.voice_channels.retain(|id| id != &channel.id);
        }
    }

    pub fn apply_channel_delete(&self, channel: &Channel) {
        let Some(guild_id) = &channel.guild_id else {
            return;
        };
        let mut state = self.lock();
        if let Some(guild) = state.guild_mut(guild_id) {
            guild.voice_channels.retain(|id| id != &channel.id);
        }
    }

    pub fn apply_member_upsert(&self, guild_id: &str, member: &GuildMember) {
        let Some(profile) = member.to_profile() else {
            return;
        };
        let mut state = self.lock();
        if let Some(guild) = state.guild_mut(guild_id) {
            guild.members.insert(profile.id.clone(), profile);
        }
    }

    pub fn apply_member_remove(&self, guild_id: &str, user_id: &str) {
        let mut state = self.lock();
        if let Some(guild) = state.guild_mut(guild_id) {
            guild.members.remove(user_id);
        }
    }

    /// Apply a VOICE_STATE_UPDATE and notify subscribers.
    pub fn apply_voice_state(&self, voice: &VoiceState) {
        let Some(guild_id) = voice.guild_id.clone() else {
            return;
        };
        let old_channel_id = {
            let mut state = self.lock();
            let Some(guild) = state.guild_mut(&guild_id) else {
                return;
            };
            if let Some(profile) = voice.member.as_ref().and_then(GuildMember::to_profile) {
                guild.members.insert(profile.id.clone(), profile);
            }

            let pos = guild
                .voice_states
                .iter()
                .position(|v| v.user_id == voice.user_id);
            let old = pos.map(|pos| guild.voice_states[pos].channel_id.clone());
            match (pos, &voice.channel_id) {
                (Some(pos), Some(channel_id)) => {
                    let entry = &mut guild.voice_states[pos];
                    entry.channel_id = channel_id.clone();
                    entry.self_mute = voice.self_mute;
                    entry.self_deaf = voice.self_deaf;
                }
                (None, Some(channel_id)) => guild.voice_states.push(CachedVoiceState {
                    user_id: voice.user_id.clone(),
                    channel_id: channel_id.clone(),
                    self_mute: voice.self_mute,
                    self_deaf: voice.self_deaf,
                }),
                (Some(pos), None) => {
                    guild.voice_states.remove(pos);
                }
                (None, None) => {}
            }
            old
        };

        let _ = self.events.send(PlatformEvent::VoiceStateUpdate {
            guild_id,
            user_id: voice.user_id.clone(),
            old_channel_id,
            new_channel_id: voice.channel_id.clone(),
        });
    }
}

impl Default for GuildCache {
    fn default() -> Self {
        Self::new()
    }
}

impl VoicePlatform for GuildCache {
    fn guild_ids(&self) -> Vec<GuildId> {
        self.lock().guilds.iter().map(|g| g.id.clone()).collect()
    }

    fn bot_voice_channel(&self, guild_id: &str) -> Option<ChannelId> {
        let state = self.lock();
        let bot = state.bot_user_id.as_deref()?;
        state
            .guild(guild_id)?
            .voice_states
            .iter()
            .find(|v| v.user_id == bot)
            .map(|v| v.channel_id.clone())
    }

    fn member_voice_channel(&self, guild_id: &str, user_id: &str) -> Option<ChannelId> {
        let state = self.lock();
        state
            .guild(guild_id)?
            .voice_states
            .iter()
            .find(|v| v.user_id == user_id)
            .map(|v| v.channel_id.clone())
    }

    fn channel_occupants(&self, channel: &ChannelRef) -> Option<Vec<Occupant>> {
        let state = self.lock();
        let guild = state.guild(&channel.guild_id)?;
        if !guild.voice_channels.contains(&channel.channel_id) {
            return None;
        }
        Some(
            guild
                .voice_states
                .iter()
                .filter(|v| v.channel_id == channel.channel_id)
                .map(|v| Occupant {
                    profile: guild.members.get(&v.user_id).cloned().unwrap_or_else(|| {
                        MemberProfile {
                            id: v.user_id.clone(),
                            username: v.user_id.clone(),
                            display_name: None,
                            avatar_url: None,
                            bot: state.bot_user_id.as_deref() == Some(v.user_id.as_str()),
                        }
                    }),
                    self_mute: v.self_mute,
                    self_deaf: v.self_deaf,
                })
                .collect(),
        )
    }

    fn member(&self, guild_id: &str, user_id: &str) -> Option<MemberProfile> {
        self.lock().guild(guild_id)?.members.get(user_id).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.events.subscribe()
    }
}
