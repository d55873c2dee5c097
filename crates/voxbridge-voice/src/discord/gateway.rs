//! Gateway session loop with heartbeat and reconnect backoff.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cache::GuildCache;
use super::model::{
    Channel, GatewayBot, GatewayPayload, GuildCreate, GuildMemberEvent, GuildMemberRemove,
    INTENTS, Ready, UnavailableGuild, VoiceServerUpdate, VoiceState, is_fatal_close, op,
};
use super::{GatewayError, VoiceDispatch};

const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub(crate) struct GatewayContext {
    pub token: String,
    pub api_base: String,
    pub cache: Arc<GuildCache>,
    pub voice_tx: broadcast::Sender<VoiceDispatch>,
}

enum SessionEnd {
    Shutdown,
    Reconnect,
}

/// Keep a gateway session alive until cancelled or a fatal close.
pub(crate) async fn run_gateway(
    ctx: GatewayContext,
    mut commands: mpsc::UnboundedReceiver<GatewayPayload>,
    cancel: CancellationToken,
) {
    let http = reqwest::Client::new();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let result = match fetch_gateway_url(&http, &ctx).await {
            Ok(url) => run_session(&ctx, &url, &mut commands, &cancel).await,
            Err(GatewayError::Fatal { code, reason }) => Err(GatewayError::Fatal { code, reason }),
            Err(e) => {
                warn!(error = %e, "Gateway URL lookup failed, using default");
                run_session(&ctx, DEFAULT_GATEWAY_URL, &mut commands, &cancel).await
            }
        };

        match result {
            Ok(SessionEnd::Shutdown) => break,
            Ok(SessionEnd::Reconnect) => {
                info!("Gateway session ended, reconnecting");
                backoff = INITIAL_BACKOFF;
            }
            Err(GatewayError::Fatal { code, reason }) => {
                error!(code, reason = %reason, "Gateway rejected the session, giving up");
                break;
            }
            Err(e) => warn!(error = %e, "Gateway session failed"),
        }

        info!(delay_ms = backoff.as_millis() as u64, "Reconnecting to gateway");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    info!("Gateway stopped");
}

async fn fetch_gateway_url(
    http: &reqwest::Client,
    ctx: &GatewayContext,
) -> Result<String, GatewayError> {
    let resp = http
        .get(format!("{}/gateway/bot", ctx.api_base))
        .header("Authorization", format!("Bot {}", ctx.token))
        .send()
        .await?;
    if resp.status() == StatusCode::UNAUTHORIZED {
        return Err(GatewayError::Fatal {
            code: 4004,
            reason: "bot token rejected".into(),
        });
    }
    let bot: GatewayBot = resp.error_for_status()?.json().await?;
    Ok(bot.url)
}

fn identify(ctx: &GatewayContext) -> GatewayPayload {
    GatewayPayload::new(
        op::IDENTIFY,
        json!({
            "token": ctx.token,
            "intents": INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "voxbridge",
                "device": "voxbridge",
            },
        }),
    )
}

pub(crate) async fn send_payload<S>(write: &mut S, payload: &GatewayPayload) -> Result<(), GatewayError>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(payload)?;
    write.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn run_session(
    ctx: &GatewayContext,
    url: &str,
    commands: &mut mpsc::UnboundedReceiver<GatewayPayload>,
    cancel: &CancellationToken,
) -> Result<SessionEnd, GatewayError> {
    let url = format!("{}/?v=10&encoding=json", url.trim_end_matches('/'));
    info!(url = %url, "Connecting to gateway");
    let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&url))
        .await
        .map_err(|_| GatewayError::Timeout("gateway connect"))??;
    let (mut write, mut read) = ws.split();

    let hello = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => break serde_json::from_str::<GatewayPayload>(text.as_str())?,
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(SessionEnd::Reconnect),
        }
    };
    if hello.op != op::HELLO {
        return Err(GatewayError::Protocol(format!("expected hello, got op {}", hello.op)));
    }
    let interval = hello
        .d
        .get("heartbeat_interval")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .filter(|interval| !interval.is_zero())
        .ok_or_else(|| GatewayError::Protocol("hello without heartbeat_interval".into()))?;

    send_payload(&mut write, &identify(ctx)).await?;

    let jitter = interval.mul_f64(rand::random::<f64>());
    let mut heartbeat = tokio::time::interval_at(Instant::now() + jitter, interval);
    let mut seq: Option<u64> = None;
    let mut acked = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(command) = commands.try_recv() {
                    let _ = send_payload(&mut write, &command).await;
                }
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Shutdown);
            }
            _ = heartbeat.tick() => {
                if !acked {
                    warn!("Heartbeat not acknowledged, reconnecting");
                    return Ok(SessionEnd::Reconnect);
                }
                acked = false;
                send_payload(&mut write, &GatewayPayload::new(op::HEARTBEAT, json!(seq))).await?;
            }
            Some(command) = commands.recv() => {
                send_payload(&mut write, &command).await?;
            }
            msg = read.next() => {
                let Some(msg) = msg else {
                    return Ok(SessionEnd::Reconnect);
                };
                match msg? {
                    Message::Text(text) => {
                        let payload = match serde_json::from_str::<GatewayPayload>(text.as_str()) {
                            Ok(payload) => payload,
                            Err(e) => {
                                debug!(error = %e, "Unparseable gateway frame");
                                continue;
                            }
                        };
                        if payload.s.is_some() {
                            seq = payload.s;
                        }
                        match payload.op {
                            op::DISPATCH => {
                                let event = payload.t.unwrap_or_default();
                                if let Err(e) = handle_dispatch(ctx, &event, payload.d) {
                                    warn!(event = %event, error = %e, "Failed to apply dispatch");
                                }
                            }
                            op::HEARTBEAT => {
                                send_payload(&mut write, &GatewayPayload::new(op::HEARTBEAT, json!(seq))).await?;
                            }
                            op::HEARTBEAT_ACK => acked = true,
                            op::RECONNECT => return Ok(SessionEnd::Reconnect),
                            op::INVALID_SESSION => {
                                warn!("Gateway invalidated the session");
                                return Ok(SessionEnd::Reconnect);
                            }
                            other => debug!(op = other, "Ignoring gateway op"),
                        }
                    }
                    Message::Close(frame) => {
                        if let Some(frame) = frame {
                            let code = u16::from(frame.code);
                            if is_fatal_close(code) {
                                return Err(GatewayError::Fatal {
                                    code,
                                    reason: frame.reason.as_str().to_string(),
                                });
                            }
                            info!(code, "Gateway closed the connection");
                        }
                        return Ok(SessionEnd::Reconnect);
                    }
                    _ => {}
                }
            }
        }
    }
}

fn handle_dispatch(ctx: &GatewayContext, event: &str, data: Value) -> Result<(), serde_json::Error> {
    match event {
        "READY" => {
            let ready: Ready = serde_json::from_value(data)?;
            info!(
                user = %ready.user.username,
                guilds = ready.guilds.len(),
                "Gateway ready"
            );
            ctx.cache.apply_ready(&ready);
        }
        "GUILD_CREATE" => ctx.cache.apply_guild_create(serde_json::from_value::<GuildCreate>(data)?),
        "GUILD_DELETE" => {
            let guild: UnavailableGuild = serde_json::from_value(data)?;
            ctx.cache.apply_guild_delete(&guild.id);
        }
        "CHANNEL_CREATE" | "CHANNEL_UPDATE" => {
            ctx.cache.apply_channel_upsert(&serde_json::from_value::<Channel>(data)?);
        }
        "CHANNEL_DELETE" => ctx.cache.apply_channel_delete(&serde_json::from_value::<Channel>(data)?),
        "GUILD_MEMBER_ADD" | "GUILD_MEMBER_UPDATE" => {
            let event: GuildMemberEvent = serde_json::from_value(data)?;
            ctx.cache.apply_member_upsert(&event.guild_id, &event.member);
        }
        "GUILD_MEMBER_REMOVE" => {
            let event: GuildMemberRemove = serde_json::from_value(data)?;
            ctx.cache.apply_member_remove(&event.guild_id, &event.user.id);
        }
        "VOICE_STATE_UPDATE" => {
            let state: VoiceState = serde_json::from_value(data)?;
            ctx.cache.apply_voice_state(&state);
            let is_bot = ctx.cache.bot_user_id().as_deref() == Some(state.user_id.as_str());
            if let (true, Some(guild_id)) = (is_bot, state.guild_id) {
                let _ = ctx.voice_tx.send(VoiceDispatch::State {
                    guild_id,
                    channel_id: state.channel_id,
                    session_id: state.session_id,
                });
            }
        }
        "VOICE_SERVER_UPDATE" => {
            let update: VoiceServerUpdate = serde_json::from_value(data)?;
            let _ = ctx.voice_tx.send(VoiceDispatch::Server {
                guild_id: update.guild_id,
                token: update.token,
                endpoint: update.endpoint,
            });
        }
        _ => {}
    }
    Ok(())
}
