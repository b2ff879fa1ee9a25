//! Tracker client logic for the BitTorrent protocol.
//!
//! Trackers are queried with an announce request and answer with a peer
//! list. Two transports exist in the wild, selected by the announce URL's
//! scheme: plain HTTP(S) GET with a bencoded response, and the binary UDP
//! protocol of BEP 15. Both are supported here behind one entry point.
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use url::Url;

pub mod http;
pub mod udp;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker unreachable: {0}")]
    Unreachable(String),

    #[error("tracker rejected the announce: {0}")]
    Rejected(String),

    #[error("malformed tracker response: {0}")]
    MalformedResponse(String),

    #[error("unsupported announce scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid announce URL: {0}")]
    Url(#[from] url::ParseError),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Announce event, sent on the first and last contact with a tracker.
/// Interval announces omit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Completed,
    Stopped,
}

impl Event {
    pub(crate) fn query_value(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Completed => "completed",
            Event::Stopped => "stopped",
        }
    }

    /// Wire code in the BEP 15 announce packet (0 means "none").
    pub(crate) fn udp_code(self) -> u32 {
        match self {
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

/// Parameters of a tracker announce.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
}

/// A peer received from the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// The parsed response to a successful announce.
#[derive(Debug)]
pub struct AnnounceResponse {
    /// Seconds the tracker wants us to wait before re-announcing.
    pub interval: u32,
    pub peers: Vec<Peer>,
}

/// Announces to a single tracker, dispatching on the URL scheme.
#[tracing::instrument(skip(request), level = "debug")]
pub async fn announce(
    announce_url: &str,
    request: &AnnounceRequest,
) -> TrackerResult<AnnounceResponse> {
    let url = Url::parse(announce_url)?;
    match url.scheme() {
        "http" | "https" => http::announce(url, request).await,
        "udp" => udp::announce(&url, request).await,
        other => Err(TrackerError::UnsupportedScheme(other.to_string())),
    }
}

/// Generates the 20-byte peer ID for this session: the client prefix
/// `-SF0001-` followed by 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-SF0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_prefix_and_full_length() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-SF0001-");
        assert_eq!(id.len(), 20);
    }

    #[test]
    fn peer_ids_differ_between_sessions() {
        assert_ne!(generate_peer_id(), generate_peer_id());
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let request = AnnounceRequest {
            info_hash: [0; 20],
            peer_id: [0; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: None,
        };
        assert!(matches!(
            announce("wss://t.example/announce", &request).await,
            Err(TrackerError::UnsupportedScheme(_))
        ));
    }
}
