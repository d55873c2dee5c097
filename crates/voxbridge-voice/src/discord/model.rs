//! Gateway payload shapes. Only the fields this bridge reads are modelled.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::platform::MemberProfile;

pub mod op {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

pub mod voice_op {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const HELLO: u8 = 8;
    pub const CLIENT_DISCONNECT: u8 = 13;
}

pub const INTENT_GUILDS: u64 = 1 << 0;
pub const INTENT_GUILD_MEMBERS: u64 = 1 << 1;
pub const INTENT_GUILD_VOICE_STATES: u64 = 1 << 7;

pub const INTENTS: u64 = INTENT_GUILDS | INTENT_GUILD_MEMBERS | INTENT_GUILD_VOICE_STATES;

const CHANNEL_GUILD_VOICE: u8 = 2;
const CHANNEL_GUILD_STAGE_VOICE: u8 = 13;

const CDN_BASE: &str = "https://cdn.discordapp.com";

/// Close codes after which reconnecting cannot succeed.
pub fn is_fatal_close(code: u16) -> bool {
    matches!(code, 4004 | 4010..=4014)
}

/// Raw gateway frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: u8, d: Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl User {
    pub fn avatar_url(&self) -> String {
        match &self.avatar {
            Some(hash) => format!("{CDN_BASE}/avatars/{}/{hash}.png?size=128", self.id),
            None => {
                let index = self.id.parse::<u64>().map(|id| (id >> 22) % 6).unwrap_or(0);
                format!("{CDN_BASE}/embed/avatars/{index}.png")
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildMember {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub nick: Option<String>,
}

impl GuildMember {
    /// Nickname, else global name, else nothing (callers fall back to username).
    pub fn display_name(&self) -> Option<String> {
        self.nick
            .clone()
            .or_else(|| self.user.as_ref().and_then(|u| u.global_name.clone()))
    }

    pub fn to_profile(&self) -> Option<MemberProfile> {
        let user = self.user.as_ref()?;
        Some(MemberProfile {
            id: user.id.clone(),
            username: user.username.clone(),
            display_name: self.display_name(),
            avatar_url: Some(user.avatar_url()),
            bot: user.bot,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub guild_id: Option<String>,
}

impl Channel {
    pub fn is_voice(&self) -> bool {
        matches!(self.kind, CHANNEL_GUILD_VOICE | CHANNEL_GUILD_STAGE_VOICE)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceState {
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub member: Option<GuildMember>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnavailableGuild {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub user: User,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildCreate {
    pub id: String,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub members: Vec<GuildMember>,
    #[serde(default)]
    pub voice_states: Vec<VoiceState>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildMemberEvent {
    pub guild_id: String,
    #[serde(flatten)]
    pub member: GuildMember,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildMemberRemove {
    pub guild_id: String,
    pub user: User,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerUpdate {
    pub guild_id: String,
    pub token: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Voice op 2: the UDP endpoint and our SSRC.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceReady {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

/// Voice op 5. Only the SSRC mapping is used; its flags do not track packet flow.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeakingPayload {
    pub user_id: String,
    pub ssrc: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientDisconnect {
    pub user_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(id: &str, avatar: Option<&str>) -> User {
        User {
            id: id.into(),
            username: "alice".into(),
            global_name: None,
            avatar: avatar.map(String::from),
            bot: false,
        }
    }

    #[test]
    fn test_avatar_url_with_hash() {
        let url = user("80351110224678912", Some("abc")).avatar_url();
        assert_eq!(
            url,
            "https://cdn.discordapp.com/avatars/80351110224678912/abc.png?size=128"
        );
    }

    #[test]
    fn test_default_avatar_from_snowflake() {
        let id: u64 = 80351110224678912;
        let url = user(&id.to_string(), None).avatar_url();
        assert_eq!(
            url,
            format!("https://cdn.discordapp.com/embed/avatars/{}.png", (id >> 22) % 6)
        );
    }

    #[test]
    fn test_display_name_precedence() {
        let mut member = GuildMember {
            user: Some(User {
                global_name: Some("Alice G".into()),
                ..user("1", None)
            }),
            nick: Some("Ally".into()),
        };
        assert_eq!(member.display_name().as_deref(), Some("Ally"));
        member.nick = None;
        assert_eq!(member.display_name().as_deref(), Some("Alice G"));
        member.user.as_mut().unwrap().global_name = None;
        assert_eq!(member.display_name(), None);
    }

    #[test]
    fn test_member_event_flattens() {
        let event: GuildMemberEvent = serde_json::from_value(json!({
            "guild_id": "G",
            "nick": null,
            "user": {"id": "1", "username": "alice", "bot": false},
            "roles": []
        }))
        .unwrap();
        assert_eq!(event.guild_id, "G");
        assert_eq!(event.member.to_profile().unwrap().username, "alice");
    }

    #[test]
    fn test_fatal_close_codes() {
        assert!(is_fatal_close(4004));
        assert!(is_fatal_close(4014));
        assert!(!is_fatal_close(4000));
        assert!(!is_fatal_close(1000));
    }

    #[test]
    fn test_voice_ready_and_speaking_payloads() {
        let ready: VoiceReady = serde_json::from_value(json!({
            "ssrc": 1,
            "ip": "127.0.0.1",
            "port": 1234,
            "modes": ["aead_aes256_gcm_rtpsize"],
            "heartbeat_interval": 1
        }))
        .unwrap();
        assert_eq!(ready.ssrc, 1);
        assert_eq!(ready.port, 1234);
        assert_eq!(ready.modes.len(), 1);

        let speaking: SpeakingPayload =
            serde_json::from_value(json!({"user_id": "5", "ssrc": 77, "speaking": 1})).unwrap();
        assert_eq!(speaking.ssrc, 77);
        assert_eq!(speaking.user_id, "5");
    }

    #[test]
    fn test_voice_channel_types() {
        let voice: Channel =
            serde_json::from_value(json!({"id": "1", "type": 2})).unwrap();
        let text: Channel = serde_json::from_value(json!({"id": "2", "type": 0})).unwrap();
        assert!(voice.is_voice());
        assert!(!text.is_voice());
    }
}
