//! Voice-link lifecycle: join, readiness wait, keep-alive, disconnect
//! recovery and teardown. One link per guild.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use voxbridge_core::config::VoiceConfig;
use voxbridge_core::types::{ChannelRef, GuildId};

use crate::error::VoiceError;
use crate::events::{VoiceEvent, VoiceEventBus};
use crate::platform::{JoinRequest, VoiceConnection, VoiceConnector, VoicePlatform};
use crate::player::AudioPlayer;
use crate::speaking::spawn_speaking_relay;
use crate::state::{LinkState, WaitError, wait_for_state};

/// Result of a successful [`VoiceLinkManager::join_channel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A new link was established and is ready.
    Joined(ChannelRef),
    /// The bot already occupies (or is joining) the channel. Nothing was done.
    AlreadyConnected(ChannelRef),
}

impl JoinOutcome {
    pub fn channel(&self) -> &ChannelRef {
        match self {
            JoinOutcome::Joined(channel) | JoinOutcome::AlreadyConnected(channel) => channel,
        }
    }
}

/// Public view of one guild's link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub channel: ChannelRef,
    pub state: LinkState,
}

struct VoiceLink {
    channel: ChannelRef,
    connection: Arc<dyn VoiceConnection>,
    cancel: CancellationToken,
    ticket: u64,
}

enum LinkEntry {
    /// Reserved before the first await so concurrent joins see the channel as occupied.
    Joining { channel: ChannelRef, ticket: u64 },
    Active(VoiceLink),
}

impl LinkEntry {
    fn channel(&self) -> &ChannelRef {
        match self {
            LinkEntry::Joining { channel, .. } => channel,
            LinkEntry::Active(link) => &link.channel,
        }
    }

    fn ticket(&self) -> u64 {
        match self {
            LinkEntry::Joining { ticket, .. } => *ticket,
            LinkEntry::Active(link) => link.ticket,
        }
    }
}

/// Releases a join's reservation and connection unless the join settled.
/// Runs on every early return and when the join future is dropped mid-await.
struct PendingJoin<'a> {
    manager: &'a VoiceLinkManager,
    guild_id: GuildId,
    ticket: u64,
    connection: Option<Arc<dyn VoiceConnection>>,
    settled: bool,
}

impl Drop for PendingJoin<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.manager
                .release(&self.guild_id, self.ticket, self.connection.take());
        }
    }
}

pub struct VoiceLinkManager {
    platform: Arc<dyn VoicePlatform>,
    connector: Arc<dyn VoiceConnector>,
    config: VoiceConfig,
    links: Mutex<HashMap<GuildId, LinkEntry>>,
    bus: VoiceEventBus,
    next_ticket: AtomicU64,
}

impl VoiceLinkManager {
    pub fn new(
        platform: Arc<dyn VoicePlatform>,
        connector: Arc<dyn VoiceConnector>,
        config: VoiceConfig,
    ) -> Self {
        Self {
            platform,
            connector,
            config,
            links: Mutex::new(HashMap::new()),
            bus: VoiceEventBus::new(),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn platform(&self) -> &Arc<dyn VoicePlatform> {
        &self.platform
    }

    pub fn bus(&self) -> &VoiceEventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<VoiceEvent> {
        self.bus.subscribe()
    }

    fn lock_links(&self) -> MutexGuard<'_, HashMap<GuildId, LinkEntry>> {
        self.links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of all links, joining ones reported as `Signalling`.
    pub fn links(&self) -> Vec<LinkInfo> {
        let links = self.lock_links();
        let mut infos: Vec<LinkInfo> = links
            .values()
            .map(|entry| LinkInfo {
                channel: entry.channel().clone(),
                state: match entry {
                    LinkEntry::Joining { .. } => LinkState::Signalling,
                    LinkEntry::Active(link) => *link.connection.state().borrow(),
                },
            })
            .collect();
        infos.sort_by(|a, b| a.channel.guild_id.cmp(&b.channel.guild_id));
        infos
    }

    /// Join the voice channel a member currently occupies.
    pub async fn join_member(
        self: &Arc<Self>,
        guild_id: &str,
        user_id: &str,
    ) -> Result<JoinOutcome, VoiceError> {
        let channel_id = self
            .platform
            .member_voice_channel(guild_id, user_id)
            .ok_or_else(|| VoiceError::NotInVoice {
                guild_id: guild_id.to_string(),
                user_id: user_id.to_string(),
            })?;
        self.join_channel(ChannelRef::new(guild_id, channel_id)).await
    }

    /// Join `channel` and wait until the link is ready.
    ///
    /// Idempotent: if the bot already sits in (or is joining) the channel,
    /// returns [`JoinOutcome::AlreadyConnected`] without side effects.
    pub async fn join_channel(
        self: &Arc<Self>,
        channel: ChannelRef,
    ) -> Result<JoinOutcome, VoiceError> {
        let (ticket, replaced) = {
            let mut links = self.lock_links();

            let bot_channel = self.platform.bot_voice_channel(&channel.guild_id);
            if bot_channel.as_deref() == Some(channel.channel_id.as_str())
                || links
                    .get(&channel.guild_id)
                    .is_some_and(|entry| *entry.channel() == channel)
            {
                debug!(%channel, "Already in voice channel");
                return Ok(JoinOutcome::AlreadyConnected(channel));
            }

            if self.platform.channel_occupants(&channel).is_none() {
                return Err(VoiceError::ChannelNotFound(channel));
            }

            let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            let replaced = links.insert(
                channel.guild_id.clone(),
                LinkEntry::Joining {
                    channel: channel.clone(),
                    ticket,
                },
            );
            (ticket, replaced)
        };

        let mut pending = PendingJoin {
            manager: self.as_ref(),
            guild_id: channel.guild_id.clone(),
            ticket,
            connection: None,
            settled: false,
        };

        if let Some(LinkEntry::Active(old)) = replaced {
            info!(from = %old.channel, to = %channel, "Moving voice link");
            self.teardown(old);
        }

        info!(
            guild_id = %channel.guild_id,
            channel_id = %channel.channel_id,
            "Joining voice channel"
        );

        let request = JoinRequest {
            channel: channel.clone(),
            self_mute: self.config.self_mute,
            self_deaf: self.config.self_deaf,
        };
        let connection = match self.connector.connect(request).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(%channel, kind = e.kind(), error = %e, "Voice join failed");
                return Err(e);
            }
        };
        pending.connection = Some(connection.clone());

        let timeout = self.config.ready_timeout();
        let mut state_rx = connection.state();
        if let Err(wait) = wait_for_state(&mut state_rx, timeout, |s| s == LinkState::Ready).await
        {
            let err = match wait {
                WaitError::Timeout => VoiceError::ConnectionTimeout {
                    channel: channel.clone(),
                    timeout,
                },
                WaitError::Destroyed | WaitError::Closed => {
                    VoiceError::ConnectionClosed(channel.clone())
                }
            };
            error!(%channel, kind = err.kind(), error = %err, "Voice link not ready");
            return Err(err);
        }

        let cancel = CancellationToken::new();
        {
            let mut links = self.lock_links();
            let reserved = matches!(
                links.get(&channel.guild_id),
                Some(LinkEntry::Joining { ticket: current, .. }) if *current == ticket
            );
            if !reserved {
                drop(links);
                warn!(%channel, "Join superseded before it completed");
                return Err(VoiceError::Superseded(channel));
            }

            connection.subscribe(AudioPlayer::silent());
            links.insert(
                channel.guild_id.clone(),
                LinkEntry::Active(VoiceLink {
                    channel: channel.clone(),
                    connection: connection.clone(),
                    cancel: cancel.clone(),
                    ticket,
                }),
            );
            pending.settled = true;
        }

        match connection.speaking() {
            Some(signals) => {
                spawn_speaking_relay(
                    self.platform.clone(),
                    channel.clone(),
                    signals,
                    self.bus.clone(),
                    cancel.clone(),
                );
            }
            None => {
                warn!(%channel, "Voice receiver unavailable, speaking updates disabled");
            }
        }

        self.spawn_supervisor(channel.clone(), connection, state_rx, ticket, cancel);

        self.bus.publish(VoiceEvent::LinkState {
            channel: channel.clone(),
            state: LinkState::Ready,
        });
        info!(%channel, "Voice link ready");
        Ok(JoinOutcome::Joined(channel))
    }

    /// Destroy the guild's link. Returns whether one existed.
    pub fn leave(&self, guild_id: &str) -> bool {
        let entry = self.lock_links().remove(guild_id);
        match entry {
            Some(LinkEntry::Active(link)) => {
                info!(channel = %link.channel, "Leaving voice channel");
                self.teardown(link);
                true
            }
            Some(LinkEntry::Joining { channel, .. }) => {
                info!(%channel, "Abandoning in-flight voice join");
                true
            }
            None => false,
        }
    }

    pub fn leave_all(&self) {
        let guilds: Vec<GuildId> = self.lock_links().keys().cloned().collect();
        for guild_id in guilds {
            self.leave(&guild_id);
        }
    }

    fn teardown(&self, link: VoiceLink) {
        link.cancel.cancel();
        link.connection.destroy();
        self.bus.publish(VoiceEvent::LinkState {
            channel: link.channel,
            state: LinkState::Destroyed,
        });
    }

    /// Drop an unsettled join. Its connection leaves the channel unless a
    /// newer join now owns the guild, in which case it is only abandoned so
    /// the winner keeps its voice state.
    fn release(
        &self,
        guild_id: &str,
        ticket: u64,
        connection: Option<Arc<dyn VoiceConnection>>,
    ) {
        let owned_by_other = {
            let mut links = self.lock_links();
            match links.get(guild_id).map(LinkEntry::ticket) {
                Some(current) if current == ticket => {
                    links.remove(guild_id);
                    false
                }
                Some(_) => true,
                None => false,
            }
        };
        let Some(connection) = connection else {
            return;
        };
        if owned_by_other {
            debug!(channel = %connection.channel(), "Abandoning superseded voice connection");
            connection.abandon();
        } else {
            connection.destroy();
        }
    }

    fn remove_if(&self, guild_id: &str, ticket: u64) -> bool {
        let mut links = self.lock_links();
        if links.get(guild_id).is_some_and(|entry| entry.ticket() == ticket) {
            links.remove(guild_id);
            true
        } else {
            false
        }
    }

    /// Watch the link's state. On `Disconnected`, give it the reconnect
    /// window to move back to Signalling or Connecting, then destroy it.
    ///
    /// `state_rx` must be the receiver the readiness wait used, so a change
    /// that lands before the task starts is still observed.
    fn spawn_supervisor(
        self: &Arc<Self>,
        channel: ChannelRef,
        connection: Arc<dyn VoiceConnection>,
        mut state_rx: watch::Receiver<LinkState>,
        ticket: u64,
        cancel: CancellationToken,
    ) {
        let manager = Arc::clone(self);
        let window = self.config.reconnect_window();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let state = *state_rx.borrow_and_update();
                manager.bus.publish(VoiceEvent::LinkState {
                    channel: channel.clone(),
                    state,
                });

                match state {
                    LinkState::Disconnected => {
                        warn!(%channel, "Voice link disconnected, waiting for recovery");
                        match wait_for_state(&mut state_rx, window, LinkState::is_recovering).await
                        {
                            Ok(recovered) => {
                                info!(%channel, state = %recovered, "Voice link recovering");
                                manager.bus.publish(VoiceEvent::LinkState {
                                    channel: channel.clone(),
                                    state: recovered,
                                });
                            }
                            Err(WaitError::Destroyed) => {
                                manager.remove_if(&channel.guild_id, ticket);
                                break;
                            }
                            Err(_) => {
                                if cancel.is_cancelled() {
                                    break;
                                }
                                let err = VoiceError::TransientDisconnect {
                                    channel: channel.clone(),
                                };
                                warn!(%channel, kind = err.kind(), error = %err, "Destroying voice link");
                                cancel.cancel();
                                connection.destroy();
                                manager.remove_if(&channel.guild_id, ticket);
                                manager.bus.publish(VoiceEvent::LinkState {
                                    channel: channel.clone(),
                                    state: LinkState::Destroyed,
                                });
                                break;
                            }
                        }
                    }
                    LinkState::Destroyed => {
                        cancel.cancel();
                        if manager.remove_if(&channel.guild_id, ticket) {
                            info!(%channel, "Voice link destroyed");
                        }
                        break;
                    }
                    _ => {}
                }
            }
            debug!(%channel, "Voice link supervisor stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::{ConnectBehavior, MemoryConnector, MemoryPlatform};
    use crate::platform::MemberProfile;

    struct Harness {
        platform: Arc<MemoryPlatform>,
        connector: Arc<MemoryConnector>,
        manager: Arc<VoiceLinkManager>,
    }

    fn harness(behavior: ConnectBehavior) -> Harness {
        let platform = Arc::new(MemoryPlatform::new("bot"));
        platform.add_guild("G");
        platform.add_channel("G", "C1");
        platform.add_channel("G", "C2");
        let connector = Arc::new(MemoryConnector::new(platform.clone(), behavior));
        let manager = Arc::new(VoiceLinkManager::new(
            platform.clone(),
            connector.clone(),
            VoiceConfig::default(),
        ));
        Harness {
            platform,
            connector,
            manager,
        }
    }

    fn manual() -> ConnectBehavior {
        ConnectBehavior {
            auto_ready: false,
            receiver: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_reaches_ready() {
        let h = harness(ConnectBehavior::default());
        let outcome = h.manager.join_channel(ChannelRef::new("G", "C1")).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Joined(ChannelRef::new("G", "C1")));
        assert_eq!(
            h.manager.links(),
            vec![LinkInfo {
                channel: ChannelRef::new("G", "C1"),
                state: LinkState::Ready,
            }]
        );
        let connection = h.connector.last_connection().unwrap();
        assert_eq!(connection.player_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_join_is_noop() {
        let h = harness(ConnectBehavior::default());
        let channel = ChannelRef::new("G", "C1");
        h.manager.join_channel(channel.clone()).await.unwrap();
        let again = h.manager.join_channel(channel.clone()).await.unwrap();

        assert_eq!(again, JoinOutcome::AlreadyConnected(channel));
        assert_eq!(h.connector.connect_count(), 1);
        assert_eq!(h.connector.last_connection().unwrap().player_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_join_sees_reservation() {
        let h = harness(manual());
        let channel = ChannelRef::new("G", "C1");

        let manager = h.manager.clone();
        let first = {
            let channel = channel.clone();
            tokio::spawn(async move { manager.join_channel(channel).await })
        };
        while h.connector.connect_count() == 0 {
            tokio::task::yield_now().await;
        }

        let second = h.manager.join_channel(channel.clone()).await.unwrap();
        assert_eq!(second, JoinOutcome::AlreadyConnected(channel.clone()));

        let connection = h.connector.last_connection().unwrap();
        connection.set_state(LinkState::Connecting);
        connection.set_state(LinkState::Ready);

        assert_eq!(first.await.unwrap().unwrap(), JoinOutcome::Joined(channel));
        assert_eq!(h.connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_times_out_without_leaving_link() {
        let h = harness(manual());
        let err = h
            .manager
            .join_channel(ChannelRef::new("G", "C1"))
            .await
            .unwrap_err();

        assert!(matches!(err, VoiceError::ConnectionTimeout { timeout, .. } if timeout == Duration::from_secs(20)));
        assert!(h.manager.links().is_empty());
        assert_eq!(
            h.connector.last_connection().unwrap().current_state(),
            LinkState::Destroyed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_channel_is_rejected() {
        let h = harness(ConnectBehavior::default());
        let err = h
            .manager
            .join_channel(ChannelRef::new("G", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::ChannelNotFound(_)));
        assert_eq!(h.connector.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_member_requires_voice_presence() {
        let h = harness(ConnectBehavior::default());
        let err = h.manager.join_member("G", "1").await.unwrap_err();
        assert!(matches!(err, VoiceError::NotInVoice { .. }));

        h.platform.join_voice("G", "1", "C2", false, false);
        let outcome = h.manager.join_member("G", "1").await.unwrap();
        assert_eq!(outcome.channel(), &ChannelRef::new("G", "C2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_recovery_keeps_link() {
        let h = harness(ConnectBehavior::default());
        h.manager.join_channel(ChannelRef::new("G", "C1")).await.unwrap();
        let connection = h.connector.last_connection().unwrap();

        connection.set_state(LinkState::Disconnected);
        tokio::time::sleep(Duration::from_secs(3)).await;
        connection.set_state(LinkState::Connecting);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(connection.current_state(), LinkState::Connecting);
        assert_eq!(h.manager.links().len(), 1);
        assert_eq!(h.connector.connect_count(), 1);

        connection.set_state(LinkState::Ready);
        tokio::task::yield_now().await;
        assert_eq!(h.manager.links()[0].state, LinkState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_disconnect_destroys_link() {
        let h = harness(ConnectBehavior::default());
        h.manager.join_channel(ChannelRef::new("G", "C1")).await.unwrap();
        let connection = h.connector.last_connection().unwrap();

        connection.set_state(LinkState::Disconnected);
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(connection.current_state(), LinkState::Destroyed);
        assert!(h.manager.links().is_empty());
        assert_eq!(h.connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_moving_channel_destroys_old_link() {
        let h = harness(ConnectBehavior::default());
        h.manager.join_channel(ChannelRef::new("G", "C1")).await.unwrap();
        let old = h.connector.last_connection().unwrap();

        h.manager.join_channel(ChannelRef::new("G", "C2")).await.unwrap();

        assert_eq!(old.current_state(), LinkState::Destroyed);
        assert_eq!(h.platform.bot_voice_channel("G").as_deref(), Some("C2"));
        assert_eq!(h.manager.links()[0].channel, ChannelRef::new("G", "C2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_receiver_is_not_fatal() {
        let h = harness(ConnectBehavior {
            auto_ready: true,
            receiver: false,
        });
        let outcome = h.manager.join_channel(ChannelRef::new("G", "C1")).await;
        assert!(outcome.is_ok());
        assert_eq!(h.manager.links().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_signals_reach_bus() {
        let h = harness(ConnectBehavior::default());
        h.platform.add_member(
            "G",
            MemberProfile {
                id: "1".into(),
                username: "alice".into(),
                display_name: None,
                avatar_url: None,
                bot: false,
            },
        );
        let mut events = h.manager.subscribe();
        h.manager.join_channel(ChannelRef::new("G", "C1")).await.unwrap();

        h.connector.last_connection().unwrap().emit_speaking("1", true);

        loop {
            if let VoiceEvent::Speaking { update, .. } = events.recv().await.unwrap() {
                assert_eq!(update.username, "alice");
                assert!(update.speaking);
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_destroys_link() {
        let h = harness(ConnectBehavior::default());
        h.manager.join_channel(ChannelRef::new("G", "C1")).await.unwrap();
        assert!(h.manager.leave("G"));
        assert!(!h.manager.leave("G"));
        assert!(h.manager.links().is_empty());
        assert_eq!(h.platform.bot_voice_channel("G"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_join_releases_reservation() {
        let h = harness(manual());
        let channel = ChannelRef::new("G", "C1");

        let manager = h.manager.clone();
        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move { manager.join_channel(channel).await })
        };
        while h.connector.connect_count() == 0 {
            tokio::task::yield_now().await;
        }
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        assert!(h.manager.links().is_empty());
        let abandoned = h.connector.last_connection().unwrap();
        assert_eq!(abandoned.current_state(), LinkState::Destroyed);

        let manager = h.manager.clone();
        let retry = {
            let channel = channel.clone();
            tokio::spawn(async move { manager.join_channel(channel).await })
        };
        while h.connector.connect_count() < 2 {
            tokio::task::yield_now().await;
        }
        let connection = h.connector.last_connection().unwrap();
        connection.set_state(LinkState::Connecting);
        connection.set_state(LinkState::Ready);

        assert_eq!(retry.await.unwrap().unwrap(), JoinOutcome::Joined(channel));
        assert_eq!(h.manager.links()[0].state, LinkState::Ready);
    }

    /// Starts joins to C1 then C2 and waits until both have connected.
    async fn overlapping_joins(
        h: &Harness,
    ) -> (
        tokio::task::JoinHandle<Result<JoinOutcome, VoiceError>>,
        tokio::task::JoinHandle<Result<JoinOutcome, VoiceError>>,
    ) {
        let spawn_join = |channel: &str| {
            let manager = h.manager.clone();
            let channel = ChannelRef::new("G", channel);
            tokio::spawn(async move { manager.join_channel(channel).await })
        };
        let first = spawn_join("C1");
        while h.connector.connect_count() < 1 {
            tokio::task::yield_now().await;
        }
        let second = spawn_join("C2");
        while h.connector.connect_count() < 2 {
            tokio::task::yield_now().await;
        }
        (first, second)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_loser_keeps_winner_in_channel() {
        let h = harness(manual());
        let (first, second) = overlapping_joins(&h).await;
        let connections = h.connector.connections();
        let (stale, winner) = (&connections[0], &connections[1]);

        winner.set_state(LinkState::Connecting);
        winner.set_state(LinkState::Ready);
        assert_eq!(
            second.await.unwrap().unwrap(),
            JoinOutcome::Joined(ChannelRef::new("G", "C2"))
        );

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, VoiceError::ConnectionTimeout { .. }));

        assert_eq!(stale.current_state(), LinkState::Destroyed);
        assert!(!stale.sent_leave());
        assert_eq!(h.platform.bot_voice_channel("G").as_deref(), Some("C2"));
        assert_eq!(
            h.manager.links(),
            vec![LinkInfo {
                channel: ChannelRef::new("G", "C2"),
                state: LinkState::Ready,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_join_is_abandoned_not_left() {
        let h = harness(manual());
        let (first, second) = overlapping_joins(&h).await;
        let connections = h.connector.connections();
        let (stale, winner) = (&connections[0], &connections[1]);

        stale.set_state(LinkState::Connecting);
        stale.set_state(LinkState::Ready);
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, VoiceError::Superseded(_)));
        assert_eq!(stale.current_state(), LinkState::Destroyed);
        assert!(!stale.sent_leave());

        winner.set_state(LinkState::Connecting);
        winner.set_state(LinkState::Ready);
        second.await.unwrap().unwrap();
        assert_eq!(h.platform.bot_voice_channel("G").as_deref(), Some("C2"));
        assert_eq!(h.manager.links()[0].state, LinkState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_during_join_destroys_connection() {
        let h = harness(manual());
        let manager = h.manager.clone();
        let pending =
            tokio::spawn(async move { manager.join_channel(ChannelRef::new("G", "C1")).await });
        while h.connector.connect_count() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(h.manager.leave("G"));
        let connection = h.connector.last_connection().unwrap();
        connection.set_state(LinkState::Connecting);
        connection.set_state(LinkState::Ready);

        assert!(matches!(
            pending.await.unwrap(),
            Err(VoiceError::Superseded(_))
        ));
        assert!(connection.sent_leave());
        assert_eq!(h.platform.bot_voice_channel("G"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_sees_disconnect_before_it_starts() {
        let h = harness(ConnectBehavior::default());
        let channel = ChannelRef::new("G", "C1");
        let connection = h
            .connector
            .connect(JoinRequest {
                channel: channel.clone(),
                self_mute: false,
                self_deaf: false,
            })
            .await
            .unwrap();
        let mut state_rx = connection.state();
        assert_eq!(*state_rx.borrow_and_update(), LinkState::Ready);

        h.connector
            .last_connection()
            .unwrap()
            .set_state(LinkState::Disconnected);
        h.manager.spawn_supervisor(
            channel,
            connection.clone(),
            state_rx,
            1,
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(*connection.state().borrow(), LinkState::Destroyed);
    }
}
