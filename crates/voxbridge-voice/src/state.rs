//! Voice link connection states and the transition table.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Connection state of a voice link.
///
/// ```text
/// Signalling -> Connecting -> Ready -> Disconnected -> {Signalling | Connecting} -> Ready
///                                      Disconnected -> Destroyed
/// ```
///
/// Any live state may move to `Destroyed`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Signalling,
    Connecting,
    Ready,
    Disconnected,
    Destroyed,
}

impl LinkState {
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Signalling, Connecting) => true,
            (Connecting, Ready) => true,
            (Signalling | Connecting | Ready, Disconnected) => true,
            (Disconnected, Signalling | Connecting) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == LinkState::Destroyed
    }

    /// States that show a disconnected link is coming back.
    pub fn is_recovering(self) -> bool {
        matches!(self, LinkState::Signalling | LinkState::Connecting)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Signalling => "signalling",
            LinkState::Connecting => "connecting",
            LinkState::Ready => "ready",
            LinkState::Disconnected => "disconnected",
            LinkState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Why a state wait ended without reaching the wanted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Destroyed,
    Closed,
}

/// Wait until the watched state satisfies `wanted`, for at most `timeout`.
///
/// Reaching `Destroyed` (unless wanted) or losing the sender ends the wait early.
pub async fn wait_for_state<F>(
    rx: &mut watch::Receiver<LinkState>,
    timeout: Duration,
    wanted: F,
) -> Result<LinkState, WaitError>
where
    F: Fn(LinkState) -> bool,
{
    let wait = async {
        loop {
            let current = *rx.borrow_and_update();
            if wanted(current) {
                return Ok(current);
            }
            if current.is_terminal() {
                return Err(WaitError::Destroyed);
            }
            if rx.changed().await.is_err() {
                return Err(WaitError::Closed);
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(WaitError::Timeout),
    }
}
