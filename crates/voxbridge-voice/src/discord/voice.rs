//! Voice connections: op 4 joins on the gateway plus a voice websocket and a
//! receive-only UDP socket for readiness, keep-alives and speaking signals.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voxbridge_core::types::{ChannelRef, UserId};

use super::cache::GuildCache;
use super::gateway::send_payload;
use super::model::{ClientDisconnect, GatewayPayload, SpeakingPayload, VoiceReady, op, voice_op};
use super::udp::{self, SpeakingTracker};
use super::{GatewayError, VoiceDispatch};
use crate::error::VoiceError;
use crate::platform::{JoinRequest, SpeakingSignal, VoiceConnection, VoiceConnector};
use crate::player::{AudioPlayer, PlayerStatus};
use crate::state::LinkState;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const SPEAKING_CAPACITY: usize = 256;

/// Voice close codes after which the same session cannot be reused.
fn is_session_lost(code: u16) -> bool {
    matches!(code, 4004 | 4006 | 4009 | 4011 | 4014 | 4021 | 4022)
}

pub struct DiscordVoiceConnector {
    cache: Arc<GuildCache>,
    commands: mpsc::UnboundedSender<GatewayPayload>,
    voice_tx: broadcast::Sender<VoiceDispatch>,
}

impl DiscordVoiceConnector {
    pub(crate) fn new(
        cache: Arc<GuildCache>,
        commands: mpsc::UnboundedSender<GatewayPayload>,
        voice_tx: broadcast::Sender<VoiceDispatch>,
    ) -> Self {
        Self {
            cache,
            commands,
            voice_tx,
        }
    }
}

#[async_trait]
impl VoiceConnector for DiscordVoiceConnector {
    async fn connect(&self, request: JoinRequest) -> Result<Arc<dyn VoiceConnection>, VoiceError> {
        let user_id = self
            .cache
            .bot_user_id()
            .ok_or_else(|| VoiceError::Platform("gateway session is not ready".into()))?;

        // Subscribe before asking so the server update cannot be missed.
        let dispatches = self.voice_tx.subscribe();
        let connection = Arc::new(DiscordVoiceConnection::new(
            request.clone(),
            self.commands.clone(),
        ));
        connection.send_voice_state(Some(&request.channel.channel_id))?;

        tokio::spawn(drive_connection(connection.clone(), user_id, dispatches));
        Ok(connection)
    }
}

pub struct DiscordVoiceConnection {
    request: JoinRequest,
    commands: mpsc::UnboundedSender<GatewayPayload>,
    state_tx: watch::Sender<LinkState>,
    speaking_tx: broadcast::Sender<SpeakingSignal>,
    players: Mutex<Vec<AudioPlayer>>,
    cancel: CancellationToken,
}

impl DiscordVoiceConnection {
    fn new(request: JoinRequest, commands: mpsc::UnboundedSender<GatewayPayload>) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Signalling);
        let (speaking_tx, _) = broadcast::channel(SPEAKING_CAPACITY);
        Self {
            request,
            commands,
            state_tx,
            speaking_tx,
            players: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn send_voice_state(&self, channel_id: Option<&str>) -> Result<(), VoiceError> {
        let payload = GatewayPayload::new(
            op::VOICE_STATE_UPDATE,
            json!({
                "guild_id": self.request.channel.guild_id,
                "channel_id": channel_id,
                "self_mute": self.request.self_mute,
                "self_deaf": self.request.self_deaf,
            }),
        );
        self.commands
            .send(payload)
            .map_err(|_| VoiceError::Platform("gateway is not running".into()))
    }

    /// Move to `next` if the transition table allows it.
    fn transition(&self, next: LinkState) -> bool {
        let changed = self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(channel = %self.request.channel, state = %next, "Voice connection state");
        }
        changed
    }

    /// Whether an attached player still wants the transport kept open.
    fn keeps_alive(&self) -> bool {
        let players = self.players.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        players
            .iter()
            .any(|player| player.status(players.len()) != PlayerStatus::Stopped)
    }
}

impl VoiceConnection for DiscordVoiceConnection {
    fn channel(&self) -> &ChannelRef {
        &self.request.channel
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    fn subscribe(&self, player: AudioPlayer) {
        let mut players = self.players.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        players.push(player);
        debug!(channel = %self.request.channel, players = players.len(), "Audio player attached");
    }

    fn speaking(&self) -> Option<broadcast::Receiver<SpeakingSignal>> {
        Some(self.speaking_tx.subscribe())
    }

    fn destroy(&self) {
        if self.state_tx.borrow().is_terminal() {
            return;
        }
        self.cancel.cancel();
        if let Err(e) = self.send_voice_state(None) {
            warn!(channel = %self.request.channel, error = %e, "Could not send voice leave");
        }
        self.transition(LinkState::Destroyed);
    }

    fn abandon(&self) {
        if self.state_tx.borrow().is_terminal() {
            return;
        }
        self.cancel.cancel();
        self.transition(LinkState::Destroyed);
    }
}

struct SocketParams {
    endpoint: String,
    token: String,
    session_id: String,
    user_id: UserId,
}

struct SocketEnd {
    generation: u64,
    reached_ready: bool,
    close_code: Option<u16>,
}

/// Follow the bot's voice state and server assignment for one connection,
/// (re)opening the voice socket whenever both are known.
async fn drive_connection(
    conn: Arc<DiscordVoiceConnection>,
    user_id: UserId,
    mut dispatches: broadcast::Receiver<VoiceDispatch>,
) {
    let channel = conn.request.channel.clone();
    let (end_tx, mut end_rx) = mpsc::unbounded_channel::<SocketEnd>();
    let mut session_id: Option<String> = None;
    let mut server: Option<(String, String)> = None;
    let mut socket: Option<CancellationToken> = None;
    let mut generation = 0u64;
    let mut retried = false;

    let stop_socket = |socket: &mut Option<CancellationToken>| {
        if let Some(token) = socket.take() {
            token.cancel();
            conn.transition(LinkState::Disconnected);
        }
    };

    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => break,
            dispatch = dispatches.recv() => match dispatch {
                Ok(VoiceDispatch::State { guild_id, channel_id, session_id: id })
                    if guild_id == channel.guild_id =>
                {
                    match channel_id {
                        Some(_) => session_id = Some(id),
                        None => {
                            info!(%channel, "Bot removed from voice channel");
                            stop_socket(&mut socket);
                            session_id = None;
                            server = None;
                            conn.transition(LinkState::Disconnected);
                        }
                    }
                }
                Ok(VoiceDispatch::Server { guild_id, token, endpoint })
                    if guild_id == channel.guild_id =>
                {
                    stop_socket(&mut socket);
                    match endpoint {
                        Some(endpoint) => server = Some((token, endpoint)),
                        None => {
                            server = None;
                            conn.transition(LinkState::Disconnected);
                        }
                    }
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%channel, skipped, "Voice dispatches lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(end) = end_rx.recv() => {
                if end.generation != generation || socket.is_none() {
                    continue;
                }
                socket = None;
                conn.transition(LinkState::Disconnected);
                if end.reached_ready {
                    retried = false;
                }
                let lost = end.close_code.is_some_and(is_session_lost);
                if lost || retried {
                    info!(%channel, code = ?end.close_code, "Voice socket closed, waiting for a new server");
                    server = None;
                } else {
                    retried = true;
                }
            }
        }

        if socket.is_none() {
            if let (Some(session_id), Some((token, endpoint))) = (&session_id, &server) {
                conn.transition(LinkState::Connecting);
                generation += 1;
                let cancel = conn.cancel.child_token();
                let params = SocketParams {
                    endpoint: endpoint.clone(),
                    token: token.clone(),
                    session_id: session_id.clone(),
                    user_id: user_id.clone(),
                };
                let task_conn = conn.clone();
                let task_cancel = cancel.clone();
                let end_tx = end_tx.clone();
                let task_generation = generation;
                tokio::spawn(async move {
                    let (reached_ready, close_code) =
                        match run_voice_socket(&task_conn, params, &task_cancel).await {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                warn!(channel = %task_conn.request.channel, error = %e, "Voice socket failed");
                                (false, None)
                            }
                        };
                    if !task_cancel.is_cancelled() {
                        let _ = end_tx.send(SocketEnd {
                            generation: task_generation,
                            reached_ready,
                            close_code,
                        });
                    }
                });
                socket = Some(cancel);
            }
        }
    }

    if let Some(token) = socket.take() {
        token.cancel();
    }
    debug!(%channel, "Voice connection driver stopped");
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn recv(socket: &Option<UdpSocket>, buf: &mut [u8]) -> std::io::Result<usize> {
    match socket {
        Some(socket) => socket.recv(buf).await,
        None => std::future::pending().await,
    }
}

/// Heartbeat period from a voice Hello. Zero, negative and non-finite
/// intervals are protocol errors.
fn heartbeat_period(hello: &Value) -> Result<Duration, GatewayError> {
    let millis = hello
        .get("heartbeat_interval")
        .and_then(Value::as_f64)
        .ok_or_else(|| GatewayError::Protocol("voice hello without interval".into()))?;
    Duration::try_from_secs_f64(millis / 1000.0)
        .ok()
        .filter(|period| !period.is_zero())
        .ok_or_else(|| GatewayError::Protocol(format!("invalid voice heartbeat interval {millis}")))
}

/// Run one voice websocket. Returns whether it reached Ready and the close code.
/// Anyone still speaking when the socket ends gets an end signal.
async fn run_voice_socket(
    conn: &DiscordVoiceConnection,
    params: SocketParams,
    cancel: &CancellationToken,
) -> Result<(bool, Option<u16>), GatewayError> {
    let mut tracker = SpeakingTracker::default();
    let result = voice_session(conn, params, cancel, &mut tracker).await;
    for signal in tracker.clear() {
        let _ = conn.speaking_tx.send(signal);
    }
    result
}

async fn voice_session(
    conn: &DiscordVoiceConnection,
    params: SocketParams,
    cancel: &CancellationToken,
    tracker: &mut SpeakingTracker,
) -> Result<(bool, Option<u16>), GatewayError> {
    let channel = &conn.request.channel;
    let host = params.endpoint.trim_start_matches("wss://");
    let url = format!("wss://{host}/?v=4");
    info!(%channel, url = %url, "Opening voice socket");

    let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&url))
        .await
        .map_err(|_| GatewayError::Timeout("voice connect"))??;
    let (mut write, mut read) = ws.split();

    send_payload(
        &mut write,
        &GatewayPayload::new(
            voice_op::IDENTIFY,
            json!({
                "server_id": channel.guild_id,
                "user_id": params.user_id,
                "session_id": params.session_id,
                "token": params.token,
            }),
        ),
    )
    .await?;

    let mut heartbeat: Option<Interval> = None;
    let mut sweep: Option<Interval> = None;
    let mut keep_alive: Option<Interval> = None;
    let mut keep_alive_counter = 0u32;
    let mut socket: Option<UdpSocket> = None;
    let mut buf = [0u8; udp::MAX_PACKET];
    let mut reached_ready = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok((reached_ready, None));
            }
            _ = tick(&mut heartbeat) => {
                let nonce = rand::random::<u32>();
                send_payload(&mut write, &GatewayPayload::new(voice_op::HEARTBEAT, json!(nonce))).await?;
            }
            _ = tick(&mut sweep) => {
                for signal in tracker.expire(Instant::now()) {
                    let _ = conn.speaking_tx.send(signal);
                }
            }
            _ = tick(&mut keep_alive) => {
                if let Some(socket) = &socket {
                    if conn.keeps_alive() {
                        socket.send(&udp::keep_alive_packet(keep_alive_counter)).await?;
                        keep_alive_counter = keep_alive_counter.wrapping_add(1);
                    }
                }
            }
            received = recv(&socket, &mut buf) => {
                let len = received?;
                if let Some(ssrc) = udp::rtp_ssrc(&buf[..len]) {
                    if let Some(signal) = tracker.on_packet(ssrc, Instant::now()) {
                        let _ = conn.speaking_tx.send(signal);
                    }
                }
            }
            msg = read.next() => {
                let Some(msg) = msg else {
                    return Ok((reached_ready, None));
                };
                match msg? {
                    Message::Text(text) => {
                        let Ok(payload) = serde_json::from_str::<GatewayPayload>(text.as_str()) else {
                            debug!(%channel, "Unparseable voice frame");
                            continue;
                        };
                        match payload.op {
                            voice_op::HELLO => {
                                heartbeat = Some(tokio::time::interval(heartbeat_period(&payload.d)?));
                            }
                            voice_op::READY => {
                                let ready: VoiceReady = serde_json::from_value(payload.d)?;
                                let mode = udp::select_mode(&ready.modes).ok_or_else(|| {
                                    GatewayError::Protocol("voice ready without encryption modes".into())
                                })?;
                                let udp_socket = udp::open(&ready.ip, ready.port).await?;
                                let (address, port) = udp::discover(&udp_socket, ready.ssrc).await?;
                                debug!(%channel, %address, port, mode, "Voice UDP discovered");
                                send_payload(
                                    &mut write,
                                    &GatewayPayload::new(
                                        voice_op::SELECT_PROTOCOL,
                                        json!({
                                            "protocol": "udp",
                                            "data": {"address": address, "port": port, "mode": mode},
                                        }),
                                    ),
                                )
                                .await?;
                                socket = Some(udp_socket);
                            }
                            voice_op::SESSION_DESCRIPTION => {
                                reached_ready = true;
                                conn.transition(LinkState::Ready);
                                sweep = Some(tokio::time::interval(udp::SWEEP_INTERVAL));
                                keep_alive = Some(tokio::time::interval(udp::KEEP_ALIVE_INTERVAL));
                            }
                            voice_op::SPEAKING => {
                                if let Ok(speaking) = serde_json::from_value::<SpeakingPayload>(payload.d) {
                                    if speaking.user_id != params.user_id {
                                        tracker.map(speaking.ssrc, speaking.user_id);
                                    }
                                }
                            }
                            voice_op::CLIENT_DISCONNECT => {
                                if let Ok(gone) = serde_json::from_value::<ClientDisconnect>(payload.d) {
                                    if let Some(signal) = tracker.remove_user(&gone.user_id) {
                                        let _ = conn.speaking_tx.send(signal);
                                    }
                                }
                            }
                            voice_op::HEARTBEAT_ACK => {}
                            other => debug!(%channel, op = other, "Ignoring voice op"),
                        }
                    }
                    Message::Close(frame) => {
                        let code = frame.map(|f| u16::from(f.code));
                        return Ok((reached_ready, code));
                    }
                    _ => {}
                }
            }
        }
    }
}
