//! Voice platform abstraction and voice-link lifecycle.
//!
//! The upstream voice platform is reached through two seams: [`VoicePlatform`]
//! (guild/channel/member lookups plus voice-state notifications) and
//! [`VoiceConnector`] (the voice-connection primitive). On top of them sit the
//! [`VoiceLinkManager`] state machine, the presence snapshot functions and the
//! speaking relay, which publish onto a [`VoiceEventBus`].

pub mod error;
pub mod events;
pub mod link;
pub mod memory;
pub mod platform;
pub mod player;
pub mod presence;
pub mod speaking;
pub mod state;

#[cfg(feature = "discord")]
pub mod discord;

pub use error::VoiceError;
pub use events::{VoiceEvent, VoiceEventBus};
pub use link::{JoinOutcome, LinkInfo, VoiceLinkManager};
pub use platform::{
    JoinRequest, MemberProfile, Occupant, PlatformEvent, SpeakingSignal, VoiceConnection,
    VoiceConnector, VoicePlatform,
};
pub use player::{AudioPlayer, NoSubscriberBehavior};
pub use state::LinkState;
