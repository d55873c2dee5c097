//! WebSocket gateway for overlay clients.
//!
//! Hosts the axum server, tracks connected sockets, fans out presence and
//! speaking events, and relays WebRTC signaling through the [`SignalingHub`].

pub mod connection;
pub mod events;
pub mod methods;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod relay;
pub mod server;
pub mod signaling;
pub mod state;

pub use server::{router, start_gateway};
pub use signaling::{Delivery, SignalingHub};
pub use state::GatewayState;
