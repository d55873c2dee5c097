//! Receive-only voice UDP: IP discovery, keep-alives and speaking detection
//! from RTP packet arrival. Payloads are never decrypted.

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;

use voxbridge_core::types::UserId;

use super::GatewayError;
use crate::platform::SpeakingSignal;

/// Silence after which a speaker is considered finished.
pub(crate) const SILENCE: Duration = Duration::from_millis(100);
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_millis(20);
pub(crate) const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const MAX_PACKET: usize = 1500;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const DISCOVERY_LEN: usize = 74;
const DISCOVERY_REQUEST: u16 = 1;
const DISCOVERY_RESPONSE: u16 = 2;

/// Encryption modes announced in Select Protocol, most preferred first.
const PREFERRED_MODES: [&str; 2] = [
    "aead_aes256_gcm_rtpsize",
    "aead_xchacha20_poly1305_rtpsize",
];

pub(crate) async fn open(ip: &str, port: u16) -> Result<UdpSocket, GatewayError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((ip, port)).await?;
    Ok(socket)
}

/// Ask the voice server which external address and port it sees for us.
pub(crate) async fn discover(socket: &UdpSocket, ssrc: u32) -> Result<(String, u16), GatewayError> {
    socket.send(&ip_discovery_request(ssrc)).await?;

    let deadline = Instant::now() + DISCOVERY_TIMEOUT;
    let mut buf = [0u8; MAX_PACKET];
    loop {
        let len = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| GatewayError::Timeout("ip discovery"))??;
        if let Some(found) = parse_ip_discovery(&buf[..len]) {
            return Ok(found);
        }
    }
}

pub(crate) fn ip_discovery_request(ssrc: u32) -> [u8; DISCOVERY_LEN] {
    let mut packet = [0u8; DISCOVERY_LEN];
    packet[0..2].copy_from_slice(&DISCOVERY_REQUEST.to_be_bytes());
    packet[2..4].copy_from_slice(&70u16.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

pub(crate) fn parse_ip_discovery(packet: &[u8]) -> Option<(String, u16)> {
    if packet.len() < DISCOVERY_LEN
        || u16::from_be_bytes([packet[0], packet[1]]) != DISCOVERY_RESPONSE
    {
        return None;
    }
    let address = &packet[8..72];
    let end = address.iter().position(|b| *b == 0).unwrap_or(address.len());
    let ip = std::str::from_utf8(&address[..end]).ok()?;
    if ip.is_empty() {
        return None;
    }
    let port = u16::from_be_bytes([packet[72], packet[73]]);
    Some((ip.to_string(), port))
}

/// SSRC of an RTP packet. RTCP and anything that is not RTP v2 yield `None`.
pub(crate) fn rtp_ssrc(packet: &[u8]) -> Option<u32> {
    if packet.len() < 12 || packet[0] >> 6 != 2 {
        return None;
    }
    if (200..=204).contains(&packet[1]) {
        return None;
    }
    Some(u32::from_be_bytes([
        packet[8], packet[9], packet[10], packet[11],
    ]))
}

pub(crate) fn select_mode(offered: &[String]) -> Option<&str> {
    let preferred: Option<&str> = PREFERRED_MODES
        .into_iter()
        .find(|mode| offered.iter().any(|o| o.as_str() == *mode));
    preferred.or_else(|| offered.first().map(String::as_str))
}

pub(crate) fn keep_alive_packet(counter: u32) -> [u8; 8] {
    let mut packet = [0u8; 8];
    packet[..4].copy_from_slice(&counter.to_le_bytes());
    packet
}

/// Maps SSRCs to users and turns packet arrival into speaking start/end.
#[derive(Debug, Default)]
pub(crate) struct SpeakingTracker {
    users: HashMap<u32, UserId>,
    active: HashMap<u32, Instant>,
}

impl SpeakingTracker {
    pub fn map(&mut self, ssrc: u32, user_id: UserId) {
        self.users.insert(ssrc, user_id);
    }

    /// Record a packet. The first packet after silence starts speaking.
    /// Packets from unmapped SSRCs are ignored.
    pub fn on_packet(&mut self, ssrc: u32, now: Instant) -> Option<SpeakingSignal> {
        let user_id = self.users.get(&ssrc)?;
        let started = self.active.insert(ssrc, now).is_none();
        started.then(|| SpeakingSignal {
            user_id: user_id.clone(),
            speaking: true,
        })
    }

    /// End every speaker silent for at least [`SILENCE`].
    pub fn expire(&mut self, now: Instant) -> Vec<SpeakingSignal> {
        let mut ended = Vec::new();
        self.active.retain(|ssrc, last| {
            if now.duration_since(*last) < SILENCE {
                return true;
            }
            if let Some(user_id) = self.users.get(ssrc) {
                ended.push(SpeakingSignal {
                    user_id: user_id.clone(),
                    speaking: false,
                });
            }
            false
        });
        ended
    }

    /// Forget a user who left. Returns an end signal if they were speaking.
    pub fn remove_user(&mut self, user_id: &str) -> Option<SpeakingSignal> {
        let ssrcs: Vec<u32> = self
            .users
            .iter()
            .filter(|(_, user)| user.as_str() == user_id)
            .map(|(ssrc, _)| *ssrc)
            .collect();
        let mut was_speaking = false;
        for ssrc in ssrcs {
            self.users.remove(&ssrc);
            was_speaking |= self.active.remove(&ssrc).is_some();
        }
        was_speaking.then(|| SpeakingSignal {
            user_id: user_id.to_string(),
            speaking: false,
        })
    }

    /// End everyone still speaking, e.g. when the socket goes away.
    pub fn clear(&mut self) -> Vec<SpeakingSignal> {
        let ended: Vec<SpeakingSignal> = self
            .active
            .drain()
            .filter_map(|(ssrc, _)| self.users.get(&ssrc))
            .map(|user_id| SpeakingSignal {
                user_id: user_id.clone(),
                speaking: false,
            })
            .collect();
        self.users.clear();
        ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp(ssrc: u32) -> Vec<u8> {
        let mut packet = vec![0x80, 0x78, 0, 1, 0, 0, 0, 0];
        packet.extend_from_slice(&ssrc.to_be_bytes());
        packet.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        packet
    }

    fn discovery_response(ip: &str, port: u16) -> [u8; DISCOVERY_LEN] {
        let mut packet = [0u8; DISCOVERY_LEN];
        packet[0..2].copy_from_slice(&DISCOVERY_RESPONSE.to_be_bytes());
        packet[2..4].copy_from_slice(&70u16.to_be_bytes());
        packet[8..8 + ip.len()].copy_from_slice(ip.as_bytes());
        packet[72..74].copy_from_slice(&port.to_be_bytes());
        packet
    }

    #[test]
    fn test_ip_discovery_request_layout() {
        let packet = ip_discovery_request(0x0102_0304);
        assert_eq!(packet.len(), 74);
        assert_eq!(&packet[0..8], &[0, 1, 0, 70, 1, 2, 3, 4]);
        assert!(packet[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_parse_ip_discovery_response() {
        let parsed = parse_ip_discovery(&discovery_response("203.0.113.7", 50004));
        assert_eq!(parsed, Some(("203.0.113.7".to_string(), 50004)));

        assert_eq!(parse_ip_discovery(&ip_discovery_request(1)), None);
        assert_eq!(parse_ip_discovery(&[0, 2, 0, 70]), None);
    }

    #[test]
    fn test_rtp_ssrc_skips_rtcp() {
        assert_eq!(rtp_ssrc(&rtp(42)), Some(42));

        let mut rtcp = rtp(42);
        rtcp[1] = 201;
        assert_eq!(rtp_ssrc(&rtcp), None);

        let mut wrong_version = rtp(42);
        wrong_version[0] = 0x40;
        assert_eq!(rtp_ssrc(&wrong_version), None);
        assert_eq!(rtp_ssrc(&[0x80, 0x78]), None);
    }

    #[test]
    fn test_select_mode_prefers_aead() {
        let offered = vec![
            "xsalsa20_poly1305".to_string(),
            "aead_xchacha20_poly1305_rtpsize".to_string(),
            "aead_aes256_gcm_rtpsize".to_string(),
        ];
        assert_eq!(select_mode(&offered), Some("aead_aes256_gcm_rtpsize"));
        assert_eq!(
            select_mode(&["something_new".to_string()]),
            Some("something_new")
        );
        assert_eq!(select_mode(&[]), None);
    }

    #[test]
    fn test_keep_alive_counter_is_little_endian() {
        assert_eq!(keep_alive_packet(258), [2, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_speaking_starts_on_first_packet_and_ends_after_silence() {
        let mut tracker = SpeakingTracker::default();
        tracker.map(7, "1".into());
        let t0 = Instant::now();

        let start = tracker.on_packet(7, t0).unwrap();
        assert_eq!(start.user_id, "1");
        assert!(start.speaking);
        assert!(tracker.on_packet(7, t0 + Duration::from_millis(20)).is_none());

        assert!(tracker.expire(t0 + Duration::from_millis(100)).is_empty());
        let ended = tracker.expire(t0 + Duration::from_millis(120));
        assert_eq!(ended.len(), 1);
        assert!(!ended[0].speaking);

        assert!(tracker.on_packet(7, t0 + Duration::from_millis(200)).is_some());
    }

    #[test]
    fn test_unmapped_ssrc_is_ignored() {
        let mut tracker = SpeakingTracker::default();
        assert!(tracker.on_packet(9, Instant::now()).is_none());
        assert!(tracker.clear().is_empty());
    }

    #[test]
    fn test_removed_user_stops_speaking() {
        let mut tracker = SpeakingTracker::default();
        tracker.map(7, "1".into());
        tracker.map(8, "2".into());
        let now = Instant::now();
        tracker.on_packet(7, now);

        let ended = tracker.remove_user("1").unwrap();
        assert_eq!(ended.user_id, "1");
        assert!(!ended.speaking);
        assert!(tracker.remove_user("2").is_none());
        assert!(tracker.on_packet(7, now).is_none());
    }

    #[tokio::test]
    async fn test_discover_reads_external_address() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; MAX_PACKET];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, DISCOVERY_LEN);
            assert_eq!(&buf[4..8], &99u32.to_be_bytes());
            server
                .send_to(&discovery_response("198.51.100.4", 61000), from)
                .await
                .unwrap();
        });

        let socket = open("127.0.0.1", server_addr.port()).await.unwrap();
        let found = discover(&socket, 99).await.unwrap();
        assert_eq!(found, ("198.51.100.4".to_string(), 61000));
        responder.await.unwrap();
    }
}
