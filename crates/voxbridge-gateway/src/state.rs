//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, mpsc};

use voxbridge_core::config::Config;
use voxbridge_core::types::SocketId;
use voxbridge_voice::{VoiceLinkManager, VoicePlatform};

use crate::signaling::SignalingHub;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub platform: Arc<dyn VoicePlatform>,
    pub voice: Arc<VoiceLinkManager>,
    pub hub: Mutex<SignalingHub>,
    pub connections: RwLock<HashMap<SocketId, ConnectionState>>,
    pub started_at: Instant,
    #[cfg(feature = "metrics")]
    pub metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Per-connection state.
pub struct ConnectionState {
    pub socket_id: SocketId,
    pub event_tx: mpsc::UnboundedSender<String>,
    pub connected_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, voice: Arc<VoiceLinkManager>) -> Self {
        Self {
            config,
            platform: voice.platform().clone(),
            voice,
            hub: Mutex::new(SignalingHub::new()),
            connections: RwLock::new(HashMap::new()),
            started_at: Instant::now(),
            #[cfg(feature = "metrics")]
            metrics_handle: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
