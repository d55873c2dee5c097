//! Registry of one Host and N Publishers, routing WebRTC signaling between them.
//!
//! The hub never touches sockets. Every operation returns the delivery the
//! transport should perform, if any.

use serde_json::Value;
use tracing::{debug, info, warn};

use voxbridge_core::protocol::{
    IceCandidateRequest, PublisherNotice, RelayedAnswer, RelayedIceCandidate, RelayedOffer,
    ServerEvent,
};
use voxbridge_core::types::{Role, SocketId, UserId};

/// An event addressed to one socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: SocketId,
    pub event: ServerEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub socket_id: SocketId,
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherEntry {
    pub socket_id: SocketId,
    pub user_id: Option<UserId>,
}

#[derive(Debug, Default)]
pub struct SignalingHub {
    host: Option<HostEntry>,
    /// Registration order; host-side ICE lookups take the first match.
    publishers: Vec<PublisherEntry>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(&self) -> Option<&HostEntry> {
        self.host.as_ref()
    }

    pub fn publishers(&self) -> &[PublisherEntry] {
        &self.publishers
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers.len()
    }

    pub fn role_of(&self, socket_id: &str) -> Option<Role> {
        if self.host.as_ref().is_some_and(|h| h.socket_id == socket_id) {
            Some(Role::Host)
        } else if self.publishers.iter().any(|p| p.socket_id == socket_id) {
            Some(Role::Publisher)
        } else {
            None
        }
    }

    /// Record a socket's role, replacing any role it had before.
    ///
    /// A new Host replaces the current one outright. A new Publisher is
    /// announced to the Host.
    pub fn register_role(
        &mut self,
        socket_id: &str,
        role: Role,
        user_id: Option<UserId>,
    ) -> Option<Delivery> {
        match role {
            Role::Host => {
                self.publishers.retain(|p| p.socket_id != socket_id);
                if let Some(previous) = &self.host {
                    if previous.socket_id != socket_id {
                        warn!(
                            previous = %previous.socket_id,
                            socket_id,
                            "Host registration replaced an existing host"
                        );
                    }
                }
                info!(socket_id, "Host registered");
                self.host = Some(HostEntry {
                    socket_id: socket_id.to_string(),
                    user_id,
                });
                None
            }
            Role::Publisher => {
                if self.host.as_ref().is_some_and(|h| h.socket_id == socket_id) {
                    self.host = None;
                }
                match self.publishers.iter_mut().find(|p| p.socket_id == socket_id) {
                    Some(entry) => entry.user_id = user_id.clone(),
                    None => self.publishers.push(PublisherEntry {
                        socket_id: socket_id.to_string(),
                        user_id: user_id.clone(),
                    }),
                }
                info!(socket_id, user_id = ?user_id, "Publisher registered");

                let host = self.host.as_ref()?;
                Some(Delivery {
                    to: host.socket_id.clone(),
                    event: ServerEvent::PublisherJoined(PublisherNotice {
                        socket_id: socket_id.to_string(),
                        user_id,
                    }),
                })
            }
        }
    }

    /// An offer goes to the Host, or nowhere.
    pub fn route_offer(
        &self,
        from_socket_id: &str,
        user_id: Option<UserId>,
        sdp: Value,
    ) -> Option<Delivery> {
        let Some(host) = &self.host else {
            debug!(from = from_socket_id, "No host registered, dropping offer");
            return None;
        };
        Some(Delivery {
            to: host.socket_id.clone(),
            event: ServerEvent::WebrtcOffer(RelayedOffer {
                from_socket_id: from_socket_id.to_string(),
                user_id,
                sdp,
            }),
        })
    }

    /// An answer goes to the named socket whether or not it is registered.
    pub fn route_answer(
        &self,
        to_socket_id: SocketId,
        user_id: Option<UserId>,
        sdp: Value,
    ) -> Delivery {
        Delivery {
            to: to_socket_id,
            event: ServerEvent::WebrtcAnswer(RelayedAnswer { sdp, user_id }),
        }
    }

    /// Route an ICE candidate: explicit target first, then Publisher to Host,
    /// then Host to the first Publisher with the given user id.
    pub fn route_ice_candidate(
        &self,
        from_socket_id: &str,
        request: IceCandidateRequest,
    ) -> Option<Delivery> {
        let IceCandidateRequest {
            to_socket_id,
            candidate,
            user_id,
        } = request;

        let target = match to_socket_id {
            Some(to) => Some(to),
            None => match self.role_of(from_socket_id) {
                Some(Role::Publisher) => self.host.as_ref().map(|h| h.socket_id.clone()),
                Some(Role::Host) => user_id.as_ref().and_then(|uid| {
                    self.publishers
                        .iter()
                        .find(|p| p.user_id.as_ref() == Some(uid))
                        .map(|p| p.socket_id.clone())
                }),
                None => None,
            },
        };

        let Some(to) = target else {
            debug!(from = from_socket_id, "No route for ICE candidate");
            return None;
        };
        Some(Delivery {
            to,
            event: ServerEvent::WebrtcIceCandidate(RelayedIceCandidate {
                candidate,
                user_id,
                from_socket_id: from_socket_id.to_string(),
            }),
        })
    }

    /// Forget a closed socket. A departing Publisher is announced to the Host.
    pub fn on_disconnect(&mut self, socket_id: &str) -> Option<Delivery> {
        if self.host.as_ref().is_some_and(|h| h.socket_id == socket_id) {
            info!(socket_id, "Host disconnected");
            self.host = None;
        }

        let pos = self.publishers.iter().position(|p| p.socket_id == socket_id)?;
        let publisher = self.publishers.remove(pos);
        info!(socket_id, "Publisher disconnected");

        let host = self.host.as_ref()?;
        Some(Delivery {
            to: host.socket_id.clone(),
            event: ServerEvent::PublisherLeft(PublisherNotice {
                socket_id: publisher.socket_id,
                user_id: publisher.user_id,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ice(to: Option<&str>, user_id: Option<&str>) -> IceCandidateRequest {
        IceCandidateRequest {
            to_socket_id: to.map(String::from),
            candidate: json!({"candidate": "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host"}),
            user_id: user_id.map(String::from),
        }
    }

    #[test]
    fn test_second_host_replaces_first() {
        let mut hub = SignalingHub::new();
        hub.register_role("H1", Role::Host, None);
        hub.register_role("H2", Role::Host, None);

        assert_eq!(hub.host().unwrap().socket_id, "H2");
        assert_eq!(hub.role_of("H1"), None);
    }

    #[test]
    fn test_publisher_announced_to_host() {
        let mut hub = SignalingHub::new();
        assert!(hub.register_role("H", Role::Host, None).is_none());

        let delivery = hub
            .register_role("P", Role::Publisher, Some("u1".into()))
            .unwrap();
        assert_eq!(delivery.to, "H");
        assert_eq!(
            delivery.event,
            ServerEvent::PublisherJoined(PublisherNotice {
                socket_id: "P".into(),
                user_id: Some("u1".into()),
            })
        );
    }

    #[test]
    fn test_publisher_without_host_is_silent() {
        let mut hub = SignalingHub::new();
        assert!(hub.register_role("P", Role::Publisher, None).is_none());
        assert_eq!(hub.publisher_count(), 1);
    }

    #[test]
    fn test_reregistration_switches_role() {
        let mut hub = SignalingHub::new();
        hub.register_role("S", Role::Host, None);
        hub.register_role("S", Role::Publisher, Some("u1".into()));
        assert!(hub.host().is_none());
        assert_eq!(hub.role_of("S"), Some(Role::Publisher));

        hub.register_role("S", Role::Host, None);
        assert_eq!(hub.publisher_count(), 0);
        assert_eq!(hub.role_of("S"), Some(Role::Host));
    }

    #[test]
    fn test_offer_goes_to_host_only() {
        let mut hub = SignalingHub::new();
        assert!(hub.route_offer("P", None, json!("sdp")).is_none());

        hub.register_role("H", Role::Host, None);
        let delivery = hub.route_offer("P", Some("u1".into()), json!("sdp")).unwrap();
        assert_eq!(delivery.to, "H");
        assert!(matches!(
            delivery.event,
            ServerEvent::WebrtcOffer(RelayedOffer { ref from_socket_id, .. }) if from_socket_id == "P"
        ));
    }

    #[test]
    fn test_answer_is_addressed_unconditionally() {
        let hub = SignalingHub::new();
        let delivery = hub.route_answer("nobody".into(), None, json!("sdp"));
        assert_eq!(delivery.to, "nobody");
    }

    #[test]
    fn test_ice_explicit_target_wins() {
        let mut hub = SignalingHub::new();
        hub.register_role("H", Role::Host, None);
        hub.register_role("P", Role::Publisher, Some("u1".into()));

        let delivery = hub.route_ice_candidate("P", ice(Some("X"), None)).unwrap();
        assert_eq!(delivery.to, "X");
    }

    #[test]
    fn test_ice_from_publisher_goes_to_host() {
        let mut hub = SignalingHub::new();
        hub.register_role("P", Role::Publisher, Some("u1".into()));
        assert!(hub.route_ice_candidate("P", ice(None, None)).is_none());

        hub.register_role("H", Role::Host, None);
        let delivery = hub.route_ice_candidate("P", ice(None, Some("u1"))).unwrap();
        assert_eq!(delivery.to, "H");
        match delivery.event {
            ServerEvent::WebrtcIceCandidate(relayed) => assert_eq!(relayed.from_socket_id, "P"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_ice_from_host_resolved_by_user_id() {
        let mut hub = SignalingHub::new();
        hub.register_role("H", Role::Host, None);
        hub.register_role("P1", Role::Publisher, Some("u1".into()));
        hub.register_role("P2", Role::Publisher, Some("u2".into()));
        hub.register_role("P3", Role::Publisher, Some("u2".into()));

        let delivery = hub.route_ice_candidate("H", ice(None, Some("u2"))).unwrap();
        assert_eq!(delivery.to, "P2");
        assert!(hub.route_ice_candidate("H", ice(None, Some("u9"))).is_none());
        assert!(hub.route_ice_candidate("H", ice(None, None)).is_none());
    }

    #[test]
    fn test_ice_from_unregistered_socket_is_dropped() {
        let mut hub = SignalingHub::new();
        hub.register_role("H", Role::Host, None);
        assert!(hub.route_ice_candidate("stranger", ice(None, Some("u1"))).is_none());
    }

    #[test]
    fn test_publisher_disconnect_notifies_host_once() {
        let mut hub = SignalingHub::new();
        hub.register_role("H", Role::Host, None);
        hub.register_role("P", Role::Publisher, Some("u1".into()));

        let delivery = hub.on_disconnect("P").unwrap();
        assert_eq!(delivery.to, "H");
        assert!(matches!(delivery.event, ServerEvent::PublisherLeft(_)));
        assert_eq!(hub.publisher_count(), 0);
        assert!(hub.on_disconnect("P").is_none());
    }

    #[test]
    fn test_host_disconnect_clears_slot() {
        let mut hub = SignalingHub::new();
        hub.register_role("H", Role::Host, None);
        hub.register_role("P", Role::Publisher, None);

        assert!(hub.on_disconnect("H").is_none());
        assert!(hub.host().is_none());
        assert!(hub.on_disconnect("P").is_none());
    }
}
