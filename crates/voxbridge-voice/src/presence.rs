//! Membership snapshots of voice channels.

use voxbridge_core::protocol::SnapshotScope;
use voxbridge_core::types::{ChannelRef, Member};

use crate::platform::{Occupant, PlatformEvent, VoicePlatform};

/// Non-bot occupants of `channel`, in platform order. Empty if the channel is unknown.
pub fn compute_snapshot(platform: &dyn VoicePlatform, channel: &ChannelRef) -> Vec<Member> {
    platform
        .channel_occupants(channel)
        .unwrap_or_default()
        .into_iter()
        .filter(|occupant| !occupant.profile.bot)
        .map(to_member)
        .collect()
}

fn to_member(occupant: Occupant) -> Member {
    let Occupant {
        profile,
        self_mute,
        self_deaf,
    } = occupant;
    Member {
        display_name: profile
            .display_name
            .unwrap_or_else(|| profile.username.clone()),
        id: profile.id,
        username: profile.username,
        avatar_url: profile.avatar_url,
        speaking: false,
        self_mute,
        self_deaf,
    }
}

/// The first channel the bot occupies, walking guilds in cache order.
pub fn first_bot_channel(platform: &dyn VoicePlatform) -> Option<ChannelRef> {
    platform.guild_ids().into_iter().find_map(|guild_id| {
        platform
            .bot_voice_channel(&guild_id)
            .map(|channel_id| ChannelRef::new(guild_id, channel_id))
    })
}

/// Snapshot for a client request.
///
/// A fully scoped request for a known channel gets that channel; anything
/// else falls back to the bot's first channel, or an empty list.
pub fn snapshot_for(platform: &dyn VoicePlatform, scope: &SnapshotScope) -> Vec<Member> {
    if let (Some(guild_id), Some(channel_id)) = (&scope.guild_id, &scope.channel_id) {
        let channel = ChannelRef::new(guild_id.clone(), channel_id.clone());
        if platform.channel_occupants(&channel).is_some() {
            return compute_snapshot(platform, &channel);
        }
    }

    match first_bot_channel(platform) {
        Some(channel) => compute_snapshot(platform, &channel),
        None => Vec::new(),
    }
}

/// Snapshot to broadcast after a voice-state change: the member's new
/// channel, else the one they left.
pub fn snapshot_for_update(
    platform: &dyn VoicePlatform,
    event: &PlatformEvent,
) -> Option<(ChannelRef, Vec<Member>)> {
    let PlatformEvent::VoiceStateUpdate {
        guild_id,
        old_channel_id,
        new_channel_id,
        ..
    } = event;
    let channel_id = new_channel_id.as_ref().or(old_channel_id.as_ref())?;
    let channel = ChannelRef::new(guild_id.clone(), channel_id.clone());
    let members = compute_snapshot(platform, &channel);
    Some((channel, members))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPlatform;
    use crate::platform::MemberProfile;

    fn human(id: &str, username: &str, display_name: Option<&str>) -> MemberProfile {
        MemberProfile {
            id: id.into(),
            username: username.into(),
            display_name: display_name.map(String::from),
            avatar_url: None,
            bot: false,
        }
    }

    fn platform_with_bot_in(guild: &str, channel: &str) -> MemoryPlatform {
        let platform = MemoryPlatform::new("bot");
        platform.add_guild(guild);
        platform.add_channel(guild, channel);
        platform.join_voice(guild, "bot", channel, true, false);
        platform
    }

    #[test]
    fn test_snapshot_excludes_bots() {
        let platform = platform_with_bot_in("G", "C37");
        platform.add_member("G", human("1", "alice", Some("Alice")));
        platform.add_member(
            "G",
            MemberProfile {
                bot: true,
                ..human("9", "music", None)
            },
        );
        platform.join_voice("G", "1", "C37", false, true);
        platform.join_voice("G", "9", "C37", false, false);

        let members = compute_snapshot(&platform, &ChannelRef::new("G", "C37"));
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, "1");
        assert_eq!(members[0].display_name, "Alice");
        assert!(members[0].self_deaf);
        assert!(!members[0].speaking);
    }

    #[test]
    fn test_display_name_falls_back_to_username() {
        let platform = platform_with_bot_in("G", "C1");
        platform.add_member("G", human("2", "bob", None));
        platform.join_voice("G", "2", "C1", false, false);

        let members = compute_snapshot(&platform, &ChannelRef::new("G", "C1"));
        assert_eq!(members[0].display_name, "bob");
    }

    #[test]
    fn test_unscoped_request_uses_bot_channel() {
        let platform = platform_with_bot_in("G", "C37");
        platform.add_member("G", human("1", "alice", None));
        platform.join_voice("G", "1", "C37", false, false);

        let members = snapshot_for(&platform, &SnapshotScope::default());
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].username, "alice");
    }

    #[test]
    fn test_unknown_scope_falls_back_to_bot_channel() {
        let platform = platform_with_bot_in("G", "C37");
        platform.add_member("G", human("1", "alice", None));
        platform.join_voice("G", "1", "C37", false, false);

        let scope = SnapshotScope {
            guild_id: Some("G".into()),
            channel_id: Some("nope".into()),
        };
        let members = snapshot_for(&platform, &scope);
        assert_eq!(members[0].id, "1");
    }

    #[test]
    fn test_scoped_request_uses_requested_channel() {
        let platform = platform_with_bot_in("G", "C37");
        platform.add_channel("G", "C2");
        platform.add_member("G", human("1", "alice", None));
        platform.add_member("G", human("2", "bob", None));
        platform.join_voice("G", "1", "C37", false, false);
        platform.join_voice("G", "2", "C2", false, false);

        let scope = SnapshotScope {
            guild_id: Some("G".into()),
            channel_id: Some("C2".into()),
        };
        let members = snapshot_for(&platform, &scope);
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].username, "bob");
    }

    #[test]
    fn test_no_bot_channel_gives_empty_snapshot() {
        let platform = MemoryPlatform::new("bot");
        platform.add_guild("G");
        assert!(snapshot_for(&platform, &SnapshotScope::default()).is_empty());
        assert!(first_bot_channel(&platform).is_none());
    }

    #[test]
    fn test_update_snapshot_uses_old_channel_on_leave() {
        let platform = platform_with_bot_in("G", "C37");
        let event = PlatformEvent::VoiceStateUpdate {
            guild_id: "G".into(),
            user_id: "1".into(),
            old_channel_id: Some("C37".into()),
            new_channel_id: None,
        };
        let (channel, members) = snapshot_for_update(&platform, &event).unwrap();
        assert_eq!(channel, ChannelRef::new("G", "C37"));
        assert!(members.is_empty());

        let nowhere = PlatformEvent::VoiceStateUpdate {
            guild_id: "G".into(),
            user_id: "1".into(),
            old_channel_id: None,
            new_channel_id: None,
        };
        assert!(snapshot_for_update(&platform, &nowhere).is_none());
    }
}
