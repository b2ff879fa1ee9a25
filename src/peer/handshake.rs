//! The BitTorrent peer handshake.
//!
//! The handshake is the first exchange on a fresh connection. It proves
//! both sides speak the protocol and are after the same torrent, and the
//! reserved bytes advertise the BEP 10 extension protocol, which the
//! metadata fetcher depends on.
use super::{PeerError, PeerResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Byte 5, mask 0x10: bit 20 of the reserved field, the BEP 10 marker.
const EXTENSION_BYTE: usize = 5;
const EXTENSION_MASK: u8 = 0x10;

/// Budget for connecting and exchanging handshakes, so dead addresses
/// from the tracker list cannot stall bootstrap.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A handshake message: protocol string, reserved bytes, info-hash and
/// peer ID, 68 bytes in total on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Builds our outgoing handshake. The extension bit is always set; a
    /// peer that ignores it simply never sends EXTENDED messages.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_MASK;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the remote side advertised the BEP 10 extension protocol.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_MASK != 0
    }

    /// Serializes into the 68-byte wire form: length-prefixed protocol
    /// string, reserved bytes, info-hash, peer ID.
    #[instrument(level = "trace")]
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads and validates a handshake from the stream.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut length_buf = [0u8; 1];
        stream.read_exact(&mut length_buf).await?;
        if length_buf[0] as usize != PROTOCOL.len() {
            return Err(PeerError::HandshakeFailed(format!(
                "protocol length {} instead of 19",
                length_buf[0]
            )));
        }

        let mut buf = [0u8; 67];
        stream.read_exact(&mut buf).await?;
        if &buf[0..19] != PROTOCOL {
            return Err(PeerError::HandshakeFailed(
                "unknown protocol string".to_string(),
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[19..27]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[27..47]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[47..67]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// The remote handshake must echo our info-hash; the peer ID is
    /// advisory and recorded as-is.
    pub fn validate(&self, expected_info_hash: [u8; 20]) -> PeerResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(PeerError::HandshakeFailed(format!(
                "info-hash mismatch: got {}, expected {}",
                hex::encode(self.info_hash),
                hex::encode(expected_info_hash)
            )));
        }
        Ok(())
    }
}

/// Connects to a peer and performs the full handshake exchange under
/// [`HANDSHAKE_TIMEOUT`]. Returns the open stream and the peer's
/// handshake.
#[instrument(level = "debug", skip(info_hash, peer_id))]
pub async fn connect(
    addr: SocketAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> PeerResult<(TcpStream, Handshake)> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        let ours = Handshake::new(info_hash, peer_id);
        stream.write_all(&ours.serialize()).await?;
        let theirs = Handshake::read(&mut stream).await?;
        Ok::<_, PeerError>((stream, theirs))
    };
    let (stream, theirs) = tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| PeerError::Timeout)??;
    theirs.validate(info_hash)?;
    Ok((stream, theirs))
}
