//! Torrent source models.
//!
//! Covers the two ways a download can be described (a `.torrent` metainfo
//! file or a magnet link) plus the on-disk file layout both expand into.
use thiserror::Error;

pub mod info_hash;
pub mod layout;
pub mod magnet;
pub mod metainfo;

pub use layout::{FileLayout, FileSlice};
pub use magnet::{MagnetError, MagnetLink};
pub use metainfo::{FileEntry, InfoDict, Metainfo};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("pieces string length is not a multiple of 20")]
    InvalidPiecesHashLength,

    #[error("pieces string describes {actual} pieces, content length requires {expected}")]
    PieceCountMismatch { expected: usize, actual: usize },

    #[error("unsafe path component in file list: {0:?}")]
    UnsafePath(String),
}

pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
