//! Shared domain types: identifiers, members, speaking updates, roles.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-assigned identifier of one transport connection.
pub type SocketId = String;

/// Platform snowflake identifiers, kept as strings end to end.
pub type GuildId = String;
pub type ChannelId = String;
pub type UserId = String;

/// A voice channel inside a guild.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
}

impl ChannelRef {
    pub fn new(guild_id: impl Into<GuildId>, channel_id: impl Into<ChannelId>) -> Self {
        Self {
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.guild_id, self.channel_id)
    }
}

/// One non-bot occupant of a voice channel as shown by the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    #[serde(rename = "avatar", default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub speaking: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Speaking start/end notification for a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakingUpdate {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub speaking: bool,
}

/// Signaling role a socket announces for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Publisher,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Publisher => f.write_str("publisher"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_serializes_overlay_shape() {
        let member = Member {
            id: "1".into(),
            username: "alice".into(),
            display_name: "alice".into(),
            avatar_url: None,
            speaking: false,
            self_mute: false,
            self_deaf: false,
        };
        let json = serde_json::to_value(&member).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "1",
                "username": "alice",
                "displayName": "alice",
                "speaking": false,
                "selfMute": false,
                "selfDeaf": false,
            })
        );
    }

    #[test]
    fn test_member_avatar_uses_overlay_key() {
        let member = Member {
            id: "2".into(),
            username: "bob".into(),
            display_name: "Bobby".into(),
            avatar_url: Some("https://cdn.example/a.png".into()),
            speaking: false,
            self_mute: true,
            self_deaf: false,
        };
        let json = serde_json::to_value(&member).unwrap();
        assert_eq!(json["avatar"], "https://cdn.example/a.png");
        assert_eq!(json["selfMute"], true);
    }

    #[test]
    fn test_role_parses_lowercase() {
        let role: Role = serde_json::from_str("\"host\"").unwrap();
        assert_eq!(role, Role::Host);
        assert!(serde_json::from_str::<Role>("\"admin\"").is_err());
    }

    #[test]
    fn test_channel_ref_display() {
        assert_eq!(ChannelRef::new("g1", "c37").to_string(), "g1/c37");
    }
}
