//! Silent keep-alive audio player.

/// What a player does when no connection is subscribed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoSubscriberBehavior {
    #[default]
    Pause,
    Play,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Idle,
    AutoPaused,
    Stopped,
}

/// An audio player that never queues a resource.
///
/// Attaching it keeps the voice transport subscribed so the platform does
/// not drop the link for inactivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPlayer {
    pub no_subscriber: NoSubscriberBehavior,
}

impl AudioPlayer {
    pub fn silent() -> Self {
        Self {
            no_subscriber: NoSubscriberBehavior::Pause,
        }
    }

    pub fn status(&self, subscribers: usize) -> PlayerStatus {
        if subscribers > 0 {
            return PlayerStatus::Idle;
        }
        match self.no_subscriber {
            NoSubscriberBehavior::Pause => PlayerStatus::AutoPaused,
            NoSubscriberBehavior::Play => PlayerStatus::Idle,
            NoSubscriberBehavior::Stop => PlayerStatus::Stopped,
        }
    }
}

impl Default for AudioPlayer {
    fn default() -> Self {
        Self::silent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_player_pauses_without_subscribers() {
        let player = AudioPlayer::silent();
        assert_eq!(player.no_subscriber, NoSubscriberBehavior::Pause);
        assert_eq!(player.status(0), PlayerStatus::AutoPaused);
        assert_eq!(player.status(1), PlayerStatus::Idle);
    }

    #[test]
    fn test_stop_behavior() {
        let player = AudioPlayer {
            no_subscriber: NoSubscriberBehavior::Stop,
        };
        assert_eq!(player.status(0), PlayerStatus::Stopped);
    }
}
