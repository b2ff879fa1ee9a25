//! UDP announce (BEP 15).
//!
//! The protocol is two fixed-format datagrams: a connect request that
//! yields a 64-bit connection id, then an announce request quoting that
//! id. Requests are retransmitted on a 15·2^n second schedule for up to
//! 8 attempts, and a connection id is only good for 60 seconds.
use super::{AnnounceRequest, AnnounceResponse, Peer, TrackerError, TrackerResult};
use byteorder::{BigEndian, ReadBytesExt};
use rand::Rng;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use url::Url;

/// Magic constant opening every connect request.
const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const MAX_ATTEMPTS: u32 = 8;
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

pub(crate) async fn announce(
    url: &Url,
    request: &AnnounceRequest,
) -> TrackerResult<AnnounceResponse> {
    let target = resolve(url).await?;
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| TrackerError::Unreachable(e.to_string()))?;
    let mut session = Session {
        socket,
        target,
        connection_id: None,
    };
    session.announce(request).await
}

async fn resolve(url: &Url) -> TrackerResult<SocketAddr> {
    let host = url
        .host_str()
        .ok_or_else(|| TrackerError::Unreachable("announce URL has no host".to_string()))?;
    let port = url
        .port()
        .ok_or_else(|| TrackerError::Unreachable("announce URL has no port".to_string()))?;
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TrackerError::Unreachable(e.to_string()))?;
    // IPv6 announce is a different packet layout and out of scope
    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| TrackerError::Unreachable(format!("no IPv4 address for {host}")))
}

struct Session {
    socket: UdpSocket,
    target: SocketAddr,
    connection_id: Option<(u64, Instant)>,
}

impl Session {
    /// Timeout for retransmission attempt `n`.
    fn retry_timeout(attempt: u32) -> Duration {
        Duration::from_secs(15u64 << attempt)
    }

    async fn announce(&mut self, request: &AnnounceRequest) -> TrackerResult<AnnounceResponse> {
        for attempt in 0..MAX_ATTEMPTS {
            let connection_id = self.connection_id().await?;
            let transaction_id: u32 = rand::rng().random();
            let key: u32 = rand::rng().random();
            let packet = announce_packet(connection_id, transaction_id, key, request);

            match self.exchange(&packet, attempt).await? {
                None => continue,
                Some(reply) => match parse_announce_response(&reply, transaction_id)? {
                    None => continue, // stray transaction id
                    Some(response) => return Ok(response),
                },
            }
        }
        Err(TrackerError::Unreachable(format!(
            "no announce response from {} after {MAX_ATTEMPTS} attempts",
            self.target
        )))
    }

    /// Returns a connection id younger than 60 seconds, performing the
    /// connect exchange when the cached one is missing or expired.
    async fn connection_id(&mut self) -> TrackerResult<u64> {
        if let Some((id, obtained_at)) = self.connection_id {
            if obtained_at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }
        for attempt in 0..MAX_ATTEMPTS {
            let transaction_id: u32 = rand::rng().random();
            let packet = connect_packet(transaction_id);
            match self.exchange(&packet, attempt).await? {
                None => continue,
                Some(reply) => match parse_connect_response(&reply, transaction_id)? {
                    None => continue,
                    Some(id) => {
                        self.connection_id = Some((id, Instant::now()));
                        return Ok(id);
                    }
                },
            }
        }
        Err(TrackerError::Unreachable(format!(
            "no connect response from {} after {MAX_ATTEMPTS} attempts",
            self.target
        )))
    }

    /// Sends one datagram and waits out this attempt's timeout for a reply.
    /// `None` means the attempt timed out and should be retransmitted.
    async fn exchange(&self, packet: &[u8], attempt: u32) -> TrackerResult<Option<Vec<u8>>> {
        self.socket
            .send_to(packet, self.target)
            .await
            .map_err(|e| TrackerError::Unreachable(e.to_string()))?;

        let mut buf = [0u8; 2048];
        match timeout(Self::retry_timeout(attempt), self.socket.recv_from(&mut buf)).await {
            Err(_) => {
                tracing::debug!(tracker = %self.target, attempt, "UDP tracker timed out");
                Ok(None)
            }
            Ok(Err(e)) => Err(TrackerError::Unreachable(e.to_string())),
            Ok(Ok((len, from))) => {
                if from != self.target {
                    return Ok(None);
                }
                Ok(Some(buf[..len].to_vec()))
            }
        }
    }
}

fn connect_packet(transaction_id: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16);
    packet.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet
}

fn announce_packet(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    request: &AnnounceRequest,
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(98);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&request.info_hash);
    packet.extend_from_slice(&request.peer_id);
    packet.extend_from_slice(&request.downloaded.to_be_bytes());
    packet.extend_from_slice(&request.left.to_be_bytes());
    packet.extend_from_slice(&request.uploaded.to_be_bytes());
    packet.extend_from_slice(&request.event.map_or(0, |e| e.udp_code()).to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes()); // IP address: default
    packet.extend_from_slice(&key.to_be_bytes());
    packet.extend_from_slice(&(-1i32).to_be_bytes()); // num_want: default
    packet.extend_from_slice(&request.port.to_be_bytes());
    packet
}

/// `Ok(None)` marks a reply for some other transaction; the caller keeps
/// waiting by retransmitting.
fn parse_connect_response(bytes: &[u8], transaction_id: u32) -> TrackerResult<Option<u64>> {
    let mut cursor = Cursor::new(bytes);
    let action = read_u32(&mut cursor)?;
    let received_txn = read_u32(&mut cursor)?;
    if received_txn != transaction_id {
        return Ok(None);
    }
    match action {
        ACTION_CONNECT => Ok(Some(read_u64(&mut cursor)?)),
        ACTION_ERROR => Err(rejection(bytes)),
        other => Err(TrackerError::MalformedResponse(format!(
            "unexpected action {other} in connect response"
        ))),
    }
}

fn parse_announce_response(
    bytes: &[u8],
    transaction_id: u32,
) -> TrackerResult<Option<AnnounceResponse>> {
    let mut cursor = Cursor::new(bytes);
    let action = read_u32(&mut cursor)?;
    let received_txn = read_u32(&mut cursor)?;
    if received_txn != transaction_id {
        return Ok(None);
    }
    match action {
        ACTION_ANNOUNCE => {}
        ACTION_ERROR => return Err(rejection(bytes)),
        other => {
            return Err(TrackerError::MalformedResponse(format!(
                "unexpected action {other} in announce response"
            )));
        }
    }

    let interval = read_u32(&mut cursor)?;
    let _leechers = read_u32(&mut cursor)?;
    let _seeders = read_u32(&mut cursor)?;

    let rest = &bytes[cursor.position() as usize..];
    if rest.len() % 6 != 0 {
        return Err(TrackerError::MalformedResponse(format!(
            "peer list of {} bytes is not a multiple of 6",
            rest.len()
        )));
    }
    let peers = rest
        .chunks_exact(6)
        .map(|chunk| Peer {
            ip: IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect();

    Ok(Some(AnnounceResponse { interval, peers }))
}

/// An action-3 packet carries a human-readable reason after the header.
fn rejection(bytes: &[u8]) -> TrackerError {
    let message = String::from_utf8_lossy(bytes.get(8..).unwrap_or_default()).into_owned();
    TrackerError::Rejected(message)
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> TrackerResult<u32> {
    cursor
        .read_u32::<BigEndian>()
        .map_err(|_| TrackerError::MalformedResponse("truncated response".to_string()))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> TrackerResult<u64> {
    cursor
        .read_u64::<BigEndian>()
        .map_err(|_| TrackerError::MalformedResponse("truncated response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Event;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0xAB; 20],
            peer_id: *b"-SF0001-abcdefghijkl",
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event: Some(Event::Started),
        }
    }

    #[test]
    fn connect_packet_layout() {
        let packet = connect_packet(0xDEAD_BEEF);
        assert_eq!(packet.len(), 16);
        assert_eq!(&packet[..8], &[0x00, 0x00, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80]);
        assert_eq!(&packet[8..12], &0u32.to_be_bytes());
        assert_eq!(&packet[12..16], &0xDEAD_BEEFu32.to_be_bytes());
    }

    #[test]
    fn announce_packet_layout() {
        let packet = announce_packet(0x1122_3344_5566_7788, 7, 9, &request());
        assert_eq!(packet.len(), 98);
        assert_eq!(&packet[..8], &0x1122_3344_5566_7788u64.to_be_bytes());
        assert_eq!(&packet[8..12], &1u32.to_be_bytes());
        assert_eq!(&packet[16..36], &[0xAB; 20]);
        assert_eq!(&packet[36..56], b"-SF0001-abcdefghijkl");
        assert_eq!(&packet[56..64], &2u64.to_be_bytes()); // downloaded
        assert_eq!(&packet[64..72], &3u64.to_be_bytes()); // left
        assert_eq!(&packet[72..80], &1u64.to_be_bytes()); // uploaded
        assert_eq!(&packet[80..84], &2u32.to_be_bytes()); // event: started
        assert_eq!(&packet[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn parses_connect_response() {
        let mut reply = Vec::new();
        reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        reply.extend_from_slice(&42u32.to_be_bytes());
        reply.extend_from_slice(&0xAA55u64.to_be_bytes());
        assert_eq!(parse_connect_response(&reply, 42).unwrap(), Some(0xAA55));
    }

    #[test]
    fn stray_transaction_id_is_ignored() {
        let mut reply = Vec::new();
        reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        reply.extend_from_slice(&41u32.to_be_bytes());
        reply.extend_from_slice(&0xAA55u64.to_be_bytes());
        assert_eq!(parse_connect_response(&reply, 42).unwrap(), None);
    }

    #[test]
    fn parses_announce_response_with_peers() {
        let mut reply = Vec::new();
        reply.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        reply.extend_from_slice(&7u32.to_be_bytes());
        reply.extend_from_slice(&1800u32.to_be_bytes());
        reply.extend_from_slice(&3u32.to_be_bytes()); // leechers
        reply.extend_from_slice(&5u32.to_be_bytes()); // seeders
        reply.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);

        let response = parse_announce_response(&reply, 7).unwrap().unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(
            response.peers,
            vec![Peer {
                ip: "127.0.0.1".parse().unwrap(),
                port: 6881
            }]
        );
    }

    #[test]
    fn error_action_carries_the_reason() {
        let mut reply = Vec::new();
        reply.extend_from_slice(&ACTION_ERROR.to_be_bytes());
        reply.extend_from_slice(&7u32.to_be_bytes());
        reply.extend_from_slice(b"overloaded");
        assert!(matches!(
            parse_announce_response(&reply, 7),
            Err(TrackerError::Rejected(reason)) if reason == "overloaded"
        ));
    }

    #[test]
    fn retry_schedule_doubles_from_fifteen_seconds() {
        assert_eq!(Session::retry_timeout(0), Duration::from_secs(15));
        assert_eq!(Session::retry_timeout(1), Duration::from_secs(30));
        assert_eq!(Session::retry_timeout(7), Duration::from_secs(1920));
    }
}
