//! Axum-based WebSocket and HTTP server.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use voxbridge_core::types::ChannelRef;
use voxbridge_voice::{JoinOutcome, VoiceError};

use crate::connection::handle_ws_connection;
use crate::state::GatewayState;

/// Build the router with all routes and layers.
pub fn router(state: Arc<GatewayState>) -> Router {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/voice/join", post(join_handler));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    start_gateway_with_shutdown(state, port, shutdown_signal()).await
}

/// Serve until `shutdown` resolves.
pub async fn start_gateway_with_shutdown<F>(
    state: Arc<GatewayState>,
    port: u16,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bind_addr = state.config.gateway_bind();
    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(state, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let connections = state.connections.read().await.len();
    let (host, publishers) = {
        let hub = state.hub.lock().await;
        (hub.host().is_some(), hub.publisher_count())
    };
    let links: Vec<_> = state
        .voice
        .links()
        .into_iter()
        .map(|link| {
            json!({
                "guildId": link.channel.guild_id,
                "channelId": link.channel.channel_id,
                "state": link.state,
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.uptime_secs(),
        "connections": connections,
        "signaling": {
            "host": host,
            "publishers": publishers,
        },
        "voiceLinks": links,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinBody {
    guild_id: String,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

fn join_error_status(err: &VoiceError) -> StatusCode {
    match err {
        VoiceError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
        VoiceError::NotInVoice { .. } | VoiceError::Superseded(_) => StatusCode::CONFLICT,
        VoiceError::ConnectionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn error_body(status: StatusCode, kind: &str, message: String) -> Response {
    (status, Json(json!({ "error": message, "kind": kind }))).into_response()
}

async fn join_handler(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<JoinBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_body(StatusCode::BAD_REQUEST, "bad_request", rejection.body_text());
        }
    };

    let result = match (body.channel_id, body.user_id) {
        (Some(channel_id), _) => {
            state
                .voice
                .join_channel(ChannelRef::new(body.guild_id, channel_id))
                .await
        }
        (None, Some(user_id)) => state.voice.join_member(&body.guild_id, &user_id).await,
        (None, None) => {
            return error_body(
                StatusCode::BAD_REQUEST,
                "bad_request",
                "channelId or userId is required".into(),
            );
        }
    };

    match result {
        Ok(outcome) => {
            let status = match &outcome {
                JoinOutcome::Joined(_) => "joined",
                JoinOutcome::AlreadyConnected(_) => "already_connected",
            };
            let channel = outcome.channel();
            Json(json!({
                "status": status,
                "guildId": channel.guild_id,
                "channelId": channel.channel_id,
            }))
            .into_response()
        }
        Err(e) => {
            warn!(kind = e.kind(), error = %e, "Voice join request failed");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error(e.kind());
            error_body(join_error_status(&e), e.kind(), e.to_string())
        }
    }
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl-C, shutting down");
        }
    }
}
