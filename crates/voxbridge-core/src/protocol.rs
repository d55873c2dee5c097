//! Overlay wire protocol.
//!
//! Every WebSocket text message is a JSON frame `{"event": ..., "payload": ...}`.
//! Inbound frames are decoded by event name into [`ClientEvent`]; outbound
//! frames are produced from [`ServerEvent`]. Session descriptions and ICE
//! candidates are carried as opaque JSON values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{GuildId, ChannelId, Member, Role, SocketId, SpeakingUpdate, UserId};

pub const EVENT_HELLO: &str = "hello";
pub const EVENT_REGISTER_ROLE: &str = "register-role";
pub const EVENT_WEBRTC_OFFER: &str = "webrtc-offer";
pub const EVENT_WEBRTC_ANSWER: &str = "webrtc-answer";
pub const EVENT_WEBRTC_ICE_CANDIDATE: &str = "webrtc-ice-candidate";
pub const EVENT_PUBLISHER_JOINED: &str = "publisher-joined";
pub const EVENT_PUBLISHER_LEFT: &str = "publisher-left";
pub const EVENT_REQUEST_SNAPSHOT: &str = "requestSnapshot";
pub const EVENT_VOICE_MEMBERS: &str = "voiceMembers";
pub const EVENT_SPEAKING: &str = "speaking";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidFrame(#[source] serde_json::Error),

    #[error("unknown event '{0}'")]
    UnknownEvent(String),

    #[error("invalid payload for '{event}': {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed role registration: {0}")]
    MalformedRegistration(String),
}

/// The envelope shared by both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::InvalidFrame)
    }
}

// --- Inbound payloads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRegistration {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRequest {
    #[serde(default)]
    pub sdp: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRequest {
    pub to_socket_id: SocketId,
    #[serde(default)]
    pub sdp: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_socket_id: Option<SocketId>,
    #[serde(default)]
    pub candidate: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

/// Optional `(guildId, channelId)` scope of a snapshot request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<GuildId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
}

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    RegisterRole(RoleRegistration),
    WebrtcOffer(OfferRequest),
    WebrtcAnswer(AnswerRequest),
    WebrtcIceCandidate(IceCandidateRequest),
    RequestSnapshot(SnapshotScope),
}

impl ClientEvent {
    /// Decode a frame by event name.
    pub fn decode(frame: Frame) -> Result<Self, ProtocolError> {
        let Frame { event, payload } = frame;
        match event.as_str() {
            EVENT_REGISTER_ROLE => serde_json::from_value(payload)
                .map(ClientEvent::RegisterRole)
                .map_err(|e| ProtocolError::MalformedRegistration(e.to_string())),
            EVENT_WEBRTC_OFFER => decode_payload(&event, payload).map(ClientEvent::WebrtcOffer),
            EVENT_WEBRTC_ANSWER => decode_payload(&event, payload).map(ClientEvent::WebrtcAnswer),
            EVENT_WEBRTC_ICE_CANDIDATE => {
                decode_payload(&event, payload).map(ClientEvent::WebrtcIceCandidate)
            }
            EVENT_REQUEST_SNAPSHOT => {
                if payload.is_null() {
                    Ok(ClientEvent::RequestSnapshot(SnapshotScope::default()))
                } else {
                    decode_payload(&event, payload).map(ClientEvent::RequestSnapshot)
                }
            }
            _ => Err(ProtocolError::UnknownEvent(event)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::RegisterRole(_) => EVENT_REGISTER_ROLE,
            ClientEvent::WebrtcOffer(_) => EVENT_WEBRTC_OFFER,
            ClientEvent::WebrtcAnswer(_) => EVENT_WEBRTC_ANSWER,
            ClientEvent::WebrtcIceCandidate(_) => EVENT_WEBRTC_ICE_CANDIDATE,
            ClientEvent::RequestSnapshot(_) => EVENT_REQUEST_SNAPSHOT,
        }
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    event: &str,
    payload: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::InvalidPayload {
        event: event.to_string(),
        source,
    })
}

// --- Outbound payloads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub socket_id: SocketId,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedOffer {
    pub from_socket_id: SocketId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub sdp: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedAnswer {
    pub sdp: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedIceCandidate {
    pub candidate: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub from_socket_id: SocketId,
}

/// Publisher arrival/departure notice sent to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherNotice {
    pub socket_id: SocketId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

/// An outbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "hello")]
    Hello(Hello),
    #[serde(rename = "webrtc-offer")]
    WebrtcOffer(RelayedOffer),
    #[serde(rename = "webrtc-answer")]
    WebrtcAnswer(RelayedAnswer),
    #[serde(rename = "webrtc-ice-candidate")]
    WebrtcIceCandidate(RelayedIceCandidate),
    #[serde(rename = "publisher-joined")]
    PublisherJoined(PublisherNotice),
    #[serde(rename = "publisher-left")]
    PublisherLeft(PublisherNotice),
    #[serde(rename = "voiceMembers")]
    VoiceMembers(Vec<Member>),
    #[serde(rename = "speaking")]
    Speaking(SpeakingUpdate),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Hello(_) => EVENT_HELLO,
            ServerEvent::WebrtcOffer(_) => EVENT_WEBRTC_OFFER,
            ServerEvent::WebrtcAnswer(_) => EVENT_WEBRTC_ANSWER,
            ServerEvent::WebrtcIceCandidate(_) => EVENT_WEBRTC_ICE_CANDIDATE,
            ServerEvent::PublisherJoined(_) => EVENT_PUBLISHER_JOINED,
            ServerEvent::PublisherLeft(_) => EVENT_PUBLISHER_LEFT,
            ServerEvent::VoiceMembers(_) => EVENT_VOICE_MEMBERS,
            ServerEvent::Speaking(_) => EVENT_SPEAKING,
        }
    }

    /// Serialize to the text frame sent over the socket.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
