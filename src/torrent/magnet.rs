//! Magnet link parsing.
//!
//! A magnet reference carries the torrent's identity (the info-hash inside
//! `xt=urn:btih:`) plus optional bootstrap hints: display name, tracker
//! URLs, expected length and web seeds. The info dictionary itself is
//! fetched later from peers via ut_metadata.
use data_encoding::BASE32_NOPAD;
use thiserror::Error;
use url::Url;

const INFOHASH_PREFIX: &str = "urn:btih:";

#[derive(Debug, Error)]
pub enum MagnetError {
    #[error("not a magnet URI")]
    NotMagnet,

    #[error("invalid magnet URI: {0}")]
    Url(#[from] url::ParseError),

    #[error("magnet URI has no xt=urn:btih: parameter")]
    MissingInfoHash,

    #[error("invalid info-hash encoding: {0}")]
    InvalidInfoHash(String),

    #[error("magnet URI names conflicting info-hashes")]
    ConflictingInfoHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: [u8; 20],
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    pub web_seeds: Vec<String>,
    pub expected_length: Option<u64>,
}

impl MagnetLink {
    /// Parses a `magnet:?...` URI.
    ///
    /// `xt` is mandatory and may appear more than once as long as every
    /// occurrence names the same digest. Unknown parameters are ignored.
    #[tracing::instrument(skip(uri), level = "debug")]
    pub fn parse(uri: &str) -> Result<MagnetLink, MagnetError> {
        let url = Url::parse(uri)?;
        if url.scheme() != "magnet" {
            return Err(MagnetError::NotMagnet);
        }

        let mut info_hash: Option<[u8; 20]> = None;
        let mut display_name = None;
        let mut trackers: Vec<String> = Vec::new();
        let mut web_seeds: Vec<String> = Vec::new();
        let mut expected_length = None;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let Some(encoded) = value.strip_prefix(INFOHASH_PREFIX) else {
                        // other xt URNs (btmh, ed2k, ...) are not ours
                        continue;
                    };
                    let digest = decode_digest(encoded)?;
                    match info_hash {
                        Some(existing) if existing != digest => {
                            return Err(MagnetError::ConflictingInfoHash);
                        }
                        _ => info_hash = Some(digest),
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => {
                    let tracker = value.into_owned();
                    if !trackers.contains(&tracker) {
                        trackers.push(tracker);
                    }
                }
                "xl" => expected_length = value.parse().ok(),
                "ws" => web_seeds.push(value.into_owned()),
                _ => {}
            }
        }

        Ok(MagnetLink {
            info_hash: info_hash.ok_or(MagnetError::MissingInfoHash)?,
            display_name,
            trackers,
            web_seeds,
            expected_length,
        })
    }
}

/// Decodes a btih digest: 40 hex characters or 32 base32 characters, both
/// case-insensitive.
fn decode_digest(encoded: &str) -> Result<[u8; 20], MagnetError> {
    let raw = match encoded.len() {
        40 => hex::decode(encoded)
            .map_err(|_| MagnetError::InvalidInfoHash(encoded.to_string()))?,
        32 => BASE32_NOPAD
            .decode(encoded.to_ascii_uppercase().as_bytes())
            .map_err(|_| MagnetError::InvalidInfoHash(encoded.to_string()))?,
        _ => return Err(MagnetError::InvalidInfoHash(encoded.to_string())),
    };
    raw.try_into()
        .map_err(|_| MagnetError::InvalidInfoHash(encoded.to_string()))
}
