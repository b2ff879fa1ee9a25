//! Metainfo parsing.
//!
//! A `.torrent` file is a bencoded dictionary whose `info` sub-dictionary
//! describes the content: piece geometry, SHA-1 digests, and the file
//! list. The whole document is decoded leniently (real-world producers
//! emit out-of-order keys) and the info-hash is computed over the original
//! `info` byte span, so non-canonical torrents keep their published
//! identity.
use crate::bencode::{self, Value};
use crate::torrent::info_hash;

use super::TorrentError;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, PartialEq, Clone)]
pub struct Metainfo {
    /// Top-level announce URL. Absent for metainfo assembled from a magnet
    /// metadata fetch.
    pub announce: Option<String>,
    /// BEP 12 tiered tracker list.
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<SystemTime>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub encoding: Option<String>,
    pub info: InfoDict,
    pub info_hash: [u8; 20],
    pub piece_hashes: Vec<[u8; 20]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct InfoDict {
    pub name: String,
    pub piece_length: u64,
    /// Concatenated 20-byte SHA-1 digests, one per piece.
    pub pieces: Vec<u8>,
    pub private: bool,
    /// Content length in single-file mode.
    pub length: Option<u64>,
    /// File list in multi-file mode; empty in single-file mode.
    pub files: Vec<FileEntry>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileEntry {
    pub length: u64,
    pub path: Vec<String>,
}

impl Metainfo {
    /// Parses a complete `.torrent` document.
    #[tracing::instrument(skip(data), level = "debug")]
    pub fn from_bytes(data: &[u8]) -> Result<Metainfo, TorrentError> {
        let info_hash = info_hash::from_torrent_bytes(data)?;
        let value = bencode::decode_lenient(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| TorrentError::InvalidFormat("root is not a dictionary".to_string()))?;

        let announce = match dict.get(b"announce".as_slice()) {
            Some(v) => Some(required_string(v, "announce")?),
            None => None,
        };
        let announce_list = match dict.get(b"announce-list".as_slice()) {
            Some(v) => parse_announce_list(v)?,
            None => Vec::new(),
        };
        let creation_date = match dict.get(b"creation date".as_slice()).and_then(Value::as_int) {
            Some(secs) if secs >= 0 => Some(UNIX_EPOCH + std::time::Duration::from_secs(secs as u64)),
            _ => None,
        };

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info = parse_info_dict(info_value)?;
        let piece_hashes = parse_pieces(&info.pieces)?;

        let metainfo = Metainfo {
            announce,
            announce_list,
            creation_date,
            comment: optional_string(dict, b"comment"),
            created_by: optional_string(dict, b"created by"),
            encoding: optional_string(dict, b"encoding"),
            info,
            info_hash,
            piece_hashes,
        };
        metainfo.check_piece_count()?;
        Ok(metainfo)
    }

    /// Builds a `Metainfo` from a bare info dictionary obtained through the
    /// ut_metadata exchange. The caller supplies the tracker list the
    /// magnet link carried; `data` must already have been verified against
    /// the magnet's info-hash.
    #[tracing::instrument(skip(data, trackers), level = "debug")]
    pub fn from_info_bytes(data: &[u8], trackers: Vec<String>) -> Result<Metainfo, TorrentError> {
        let value = bencode::decode_lenient(data)?;
        let info = parse_info_dict(&value)?;
        let piece_hashes = parse_pieces(&info.pieces)?;

        let metainfo = Metainfo {
            announce: None,
            announce_list: vec![trackers],
            creation_date: None,
            comment: None,
            created_by: None,
            encoding: None,
            info_hash: info_hash::sha1_digest(data),
            info,
            piece_hashes,
        };
        metainfo.check_piece_count()?;
        Ok(metainfo)
    }

    /// Total content length across all files.
    pub fn total_length(&self) -> u64 {
        if self.info.files.is_empty() {
            self.info.length.unwrap_or(0)
        } else {
            self.info.files.iter().map(|f| f.length).sum()
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`: `piece_length` for every piece but the
    /// last, which carries the remainder.
    pub fn piece_size(&self, index: u32) -> u32 {
        let start = index as u64 * self.info.piece_length;
        let end = (start + self.info.piece_length).min(self.total_length());
        end.saturating_sub(start) as u32
    }

    /// Announce URLs in priority order: the top-level `announce` first,
    /// then the flattened `announce-list` tiers, deduplicated.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let candidates = self
            .announce
            .iter()
            .chain(self.announce_list.iter().flatten());
        for url in candidates {
            if !urls.iter().any(|seen| seen == url) {
                urls.push(url.clone());
            }
        }
        urls
    }

    fn check_piece_count(&self) -> Result<(), TorrentError> {
        let expected = self.total_length().div_ceil(self.info.piece_length) as usize;
        if self.piece_hashes.len() != expected {
            return Err(TorrentError::PieceCountMismatch {
                expected,
                actual: self.piece_hashes.len(),
            });
        }
        Ok(())
    }
}

/// Splits the concatenated `pieces` string into 20-byte SHA-1 digests.
/// The position of each digest is its piece index.
#[tracing::instrument(skip(pieces_bytes), level = "trace")]
fn parse_pieces(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>, TorrentError> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    let mut hashes = Vec::with_capacity(pieces_bytes.len() / 20);
    for chunk in pieces_bytes.chunks_exact(20) {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(chunk);
        hashes.push(hash);
    }
    Ok(hashes)
}

/// Parses the BEP 12 `announce-list`: a list of tiers, each a list of
/// tracker URL strings.
fn parse_announce_list(value: &Value) -> Result<Vec<Vec<String>>, TorrentError> {
    let tiers = value
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFormat("announce-list is not a list".to_string()))?;
    let mut result = Vec::with_capacity(tiers.len());
    for tier in tiers {
        let trackers = tier
            .as_list()
            .ok_or_else(|| TorrentError::InvalidFormat("announce tier is not a list".to_string()))?;
        let mut tier_urls = Vec::with_capacity(trackers.len());
        for tracker in trackers {
            tier_urls.push(required_string(tracker, "announce-list entry")?);
        }
        result.push(tier_urls);
    }
    Ok(result)
}

fn parse_info_dict(value: &Value) -> Result<InfoDict, TorrentError> {
    let dict = value
        .as_dict()
        .ok_or_else(|| TorrentError::InvalidFormat("info is not a dictionary".to_string()))?;

    let piece_length = match dict.get(b"piece length".as_slice()).and_then(Value::as_int) {
        Some(len) if len > 0 => len as u64,
        _ => return Err(TorrentError::MissingField("piece length".to_string())),
    };
    let pieces = dict
        .get(b"pieces".as_slice())
        .and_then(Value::as_bytes)
        .ok_or_else(|| TorrentError::MissingField("pieces".to_string()))?
        .to_vec();
    let private = matches!(
        dict.get(b"private".as_slice()).and_then(Value::as_int),
        Some(1)
    );
    let name = required_string(
        dict.get(b"name".as_slice())
            .ok_or_else(|| TorrentError::MissingField("name".to_string()))?,
        "name",
    )?;

    let length = match dict.get(b"length".as_slice()) {
        Some(v) => Some(non_negative(v, "length")?),
        None => None,
    };
    let files = match dict.get(b"files".as_slice()) {
        Some(v) => parse_file_list(v)?,
        None => Vec::new(),
    };

    if length.is_none() && files.is_empty() {
        return Err(TorrentError::MissingField("length or files".to_string()));
    }

    Ok(InfoDict {
        name,
        piece_length,
        pieces,
        private,
        length,
        files,
    })
}

fn parse_file_list(value: &Value) -> Result<Vec<FileEntry>, TorrentError> {
    let list = value
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFormat("files is not a list".to_string()))?;
    let mut files = Vec::with_capacity(list.len());
    for entry in list {
        let dict = entry
            .as_dict()
            .ok_or_else(|| TorrentError::InvalidFormat("file entry is not a dictionary".to_string()))?;
        let length = non_negative(
            dict.get(b"length".as_slice())
                .ok_or_else(|| TorrentError::MissingField("file length".to_string()))?,
            "file length",
        )?;
        let path_list = dict
            .get(b"path".as_slice())
            .and_then(Value::as_list)
            .ok_or_else(|| TorrentError::MissingField("file path".to_string()))?;
        let mut path = Vec::with_capacity(path_list.len());
        for component in path_list {
            path.push(required_string(component, "file path component")?);
        }
        if path.is_empty() {
            return Err(TorrentError::MissingField("file path".to_string()));
        }
        files.push(FileEntry { length, path });
    }
    Ok(files)
}

fn required_string(value: &Value, field: &str) -> Result<String, TorrentError> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| TorrentError::InvalidFormat(format!("{field} is not a UTF-8 string")))
}

fn optional_string(dict: &BTreeMap<Vec<u8>, Value>, key: &[u8]) -> Option<String> {
    dict.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn non_negative(value: &Value, field: &str) -> Result<u64, TorrentError> {
    match value.as_int() {
        Some(len) if len >= 0 => Ok(len as u64),
        _ => Err(TorrentError::InvalidFormat(format!(
            "{field} is not a non-negative integer"
        ))),
    }
}
