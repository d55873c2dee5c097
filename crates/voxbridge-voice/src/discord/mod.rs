//! Discord implementation of the platform seams.
//!
//! A single gateway session keeps [`GuildCache`] current and carries voice
//! state updates (op 4) for [`DiscordVoiceConnector`]. Each voice connection
//! runs its own voice websocket plus a receive-only UDP socket. Speaking is
//! detected from RTP packet arrival; payloads are never decrypted or relayed.

mod cache;
mod gateway;
mod model;
mod udp;
mod voice;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use voxbridge_core::config::DiscordConfig;
use voxbridge_core::types::{ChannelId, GuildId};

pub use cache::GuildCache;
pub use voice::{DiscordVoiceConnection, DiscordVoiceConnector};

use gateway::GatewayContext;

const VOICE_DISPATCH_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UDP error: {0}")]
    Io(#[from] std::io::Error),

    #[error("closed with fatal code {code}: {reason}")]
    Fatal { code: u16, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Gateway dispatches a voice connection needs to open its voice socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VoiceDispatch {
    /// The bot's own voice state changed.
    State {
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        session_id: String,
    },
    /// Voice server assigned (or lost, when `endpoint` is `None`).
    Server {
        guild_id: GuildId,
        token: String,
        endpoint: Option<String>,
    },
}

/// Running Discord client: gateway task plus the platform seams it feeds.
pub struct DiscordClient {
    cache: Arc<GuildCache>,
    connector: Arc<DiscordVoiceConnector>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DiscordClient {
    /// Spawn the gateway session. Must be called inside a tokio runtime.
    pub fn start(token: String, config: &DiscordConfig) -> Self {
        let cache = Arc::new(GuildCache::new());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (voice_tx, _) = broadcast::channel(VOICE_DISPATCH_CAPACITY);
        let cancel = CancellationToken::new();

        let ctx = GatewayContext {
            token,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            cache: cache.clone(),
            voice_tx: voice_tx.clone(),
        };
        let task = tokio::spawn(gateway::run_gateway(ctx, commands_rx, cancel.clone()));
        let connector = Arc::new(DiscordVoiceConnector::new(
            cache.clone(),
            commands_tx,
            voice_tx,
        ));

        Self {
            cache,
            connector,
            cancel,
            task,
        }
    }

    pub fn platform(&self) -> Arc<GuildCache> {
        self.cache.clone()
    }

    pub fn connector(&self) -> Arc<DiscordVoiceConnector> {
        self.connector.clone()
    }

    /// Close the gateway session after flushing queued commands.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Gateway task ended abnormally");
        }
    }
}
