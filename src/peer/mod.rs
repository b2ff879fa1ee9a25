//! Peer wire protocol.
//!
//! Everything that happens on a TCP connection to another peer: the
//! handshake, message framing, the bitfield, the BEP 10 extension layer,
//! and the per-peer connection task driving it all.
use thiserror::Error;

pub mod bitfield;
pub mod connection;
pub mod extension;
pub mod handshake;
pub mod message;

pub use bitfield::Bitfield;
pub use connection::{Connection, PeerCommand, PeerEvent};
pub use handshake::Handshake;
pub use message::Message;

/// Engine-local identifier for one peer connection.
pub type PeerIndex = usize;

/// One block request on the wire: a sub-range of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("peer protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("peer timed out")]
    Timeout,

    #[error("invalid extension payload: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("peer does not support the extension protocol")]
    ExtensionsUnsupported,

    #[error("peer rejected metadata piece {0}")]
    MetadataRejected(u32),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
