//! Metadata download for magnet starts (BEP 9).
//!
//! A magnet link names the info-hash but not the info dictionary, so the
//! dictionary itself is pulled from peers over the extension protocol:
//! exchange extension handshakes, learn `metadata_size`, request the
//! 16 KiB metadata pieces in order, then check SHA-1 of the assembly
//! against the info-hash. Several peers are tried in parallel and the
//! first valid assembly wins; a peer whose assembly fails verification is
//! not asked again this session.
use crate::peer::extension::{
    ExtendedHandshake, MetadataMessage, HANDSHAKE_EXT_ID, METADATA_PIECE_SIZE, UT_METADATA_ID,
};
use crate::peer::handshake;
use crate::peer::message::{Message, MAX_FRAME_LEN};
use crate::peer::{PeerError, PeerResult};
use crate::torrent::info_hash::sha1_digest;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinSet;

/// Budget for one peer's whole metadata exchange.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// How many peers to work concurrently.
const FETCH_PARALLELISM: usize = 30;

/// Upper bound on a plausible info dictionary; anything bigger is a peer
/// playing games with our memory.
const MAX_METADATA_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata assembly does not hash to the magnet's info-hash")]
    InfoHashMismatch,

    #[error("no peer supplied usable metadata")]
    Exhausted,
}

/// Fetches and verifies the info dictionary from the given peers.
#[tracing::instrument(level = "debug", skip_all, fields(peers = peers.len()))]
pub async fn fetch(
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    peers: &[SocketAddr],
) -> Result<Vec<u8>, MetadataError> {
    let mut tasks = JoinSet::new();
    for &addr in peers.iter().take(FETCH_PARALLELISM) {
        tasks.spawn(async move {
            let result = tokio::time::timeout(
                FETCH_TIMEOUT,
                fetch_from_peer(addr, info_hash, our_peer_id),
            )
            .await
            .unwrap_or(Err(PeerError::Timeout));
            (addr, result)
        });
    }

    let mut saw_mismatch = false;
    while let Some(joined) = tasks.join_next().await {
        let Ok((addr, result)) = joined else {
            continue;
        };
        match result {
            Ok(assembly) => {
                if sha1_digest(&assembly) == info_hash {
                    tracing::debug!(%addr, bytes = assembly.len(), "metadata verified");
                    tasks.abort_all();
                    return Ok(assembly);
                }
                // blacklisted for the session by never being retried
                tracing::warn!(%addr, "metadata assembly failed verification, dropping peer");
                saw_mismatch = true;
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "metadata fetch from peer failed");
            }
        }
    }

    if saw_mismatch {
        Err(MetadataError::InfoHashMismatch)
    } else {
        Err(MetadataError::Exhausted)
    }
}

/// Runs the full exchange against one peer and returns its (unverified)
/// metadata assembly.
async fn fetch_from_peer(
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
) -> PeerResult<Vec<u8>> {
    let (mut stream, theirs) = handshake::connect(addr, info_hash, our_peer_id).await?;
    if !theirs.supports_extensions() {
        return Err(PeerError::ExtensionsUnsupported);
    }

    Message::Extended {
        ext_id: HANDSHAKE_EXT_ID,
        payload: ExtendedHandshake::ours().to_bytes()?,
    }
    .write_to(&mut stream)
    .await?;

    let remote = await_extension_handshake(&mut stream).await?;
    let ut_metadata = remote.ut_metadata.ok_or(PeerError::ExtensionsUnsupported)?;
    let size = match remote.metadata_size {
        Some(size) if size > 0 && size <= MAX_METADATA_SIZE => size,
        _ => {
            return Err(PeerError::ProtocolViolation(
                "peer advertised no usable metadata_size".to_string(),
            ));
        }
    };

    let num_pieces = size.div_ceil(METADATA_PIECE_SIZE as u64) as u32;
    let mut assembly = Vec::with_capacity(size as usize);
    for piece in 0..num_pieces {
        Message::Extended {
            ext_id: ut_metadata,
            payload: MetadataMessage::Request { piece }.to_bytes()?,
        }
        .write_to(&mut stream)
        .await?;

        let data = await_metadata_piece(&mut stream, piece, size).await?;
        assembly.extend_from_slice(&data);
    }

    if assembly.len() as u64 != size {
        return Err(PeerError::ProtocolViolation(format!(
            "assembled {} bytes of metadata, peer advertised {size}",
            assembly.len()
        )));
    }
    Ok(assembly)
}

/// Reads until the peer's extension handshake arrives, discarding the
/// unrelated chatter (bitfield, have, unchoke) a fresh connection brings.
async fn await_extension_handshake(stream: &mut TcpStream) -> PeerResult<ExtendedHandshake> {
    loop {
        match Message::read_from(stream, MAX_FRAME_LEN).await? {
            Message::Extended {
                ext_id: HANDSHAKE_EXT_ID,
                payload,
            } => return ExtendedHandshake::from_bytes(&payload),
            _ => continue,
        }
    }
}

/// Reads until metadata piece `piece` arrives and validates its size:
/// every piece is 16 KiB except the last, which carries the remainder.
async fn await_metadata_piece(
    stream: &mut TcpStream,
    piece: u32,
    total_size: u64,
) -> PeerResult<Vec<u8>> {
    loop {
        let payload = match Message::read_from(stream, MAX_FRAME_LEN).await? {
            Message::Extended {
                ext_id: UT_METADATA_ID,
                payload,
            } => payload,
            _ => continue,
        };
        match MetadataMessage::from_bytes(&payload)? {
            MetadataMessage::Data {
                piece: received,
                data,
                ..
            } => {
                if received != piece {
                    return Err(PeerError::ProtocolViolation(format!(
                        "metadata piece {received} in response to a request for {piece}"
                    )));
                }
                let offset = piece as u64 * METADATA_PIECE_SIZE as u64;
                let expected = (total_size - offset).min(METADATA_PIECE_SIZE as u64);
                if data.len() as u64 != expected {
                    return Err(PeerError::ProtocolViolation(format!(
                        "metadata piece {piece} of {} bytes, expected {expected}",
                        data.len()
                    )));
                }
                return Ok(data);
            }
            MetadataMessage::Reject { piece } => {
                return Err(PeerError::MetadataRejected(piece));
            }
            MetadataMessage::Request { .. } => continue,
        }
    }
}
