use super::TorrentError;
use crate::bencode;
use sha1::Digest;
use sha1::Sha1;

/// SHA-1 of an arbitrary byte slice as a fixed 20-byte array.
///
/// Used for the info-hash, for piece verification, and for checking a
/// metadata assembly fetched from peers.
pub fn sha1_digest(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let result = hasher.finalize();

    let mut digest = [0u8; 20];
    digest.copy_from_slice(&result[..]);
    digest
}

/// Computes the info-hash of a metainfo document.
///
/// The hash is taken over the original byte span of the `info` value, not
/// over a re-encoding. Some producers publish torrents whose dictionaries
/// are not in canonical key order; their advertised info-hash covers the
/// bytes they actually wrote, and re-encoding would change the identity.
pub fn from_torrent_bytes(data: &[u8]) -> Result<[u8; 20], TorrentError> {
    let span = bencode::info_span(data)?
        .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
    Ok(sha1_digest(&data[span]))
}
