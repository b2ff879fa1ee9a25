//! HTTP(S) announce.
//!
//! The request is a GET whose query carries the raw 20-byte info-hash and
//! peer ID percent-encoded byte-by-byte; the response is a bencoded
//! dictionary with the re-announce interval and the peer list in either
//! compact (6 bytes per peer) or dictionary form.
use super::{AnnounceRequest, AnnounceResponse, Peer, TrackerError, TrackerResult};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use url::Url;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) async fn announce(
    mut url: Url,
    request: &AnnounceRequest,
) -> TrackerResult<AnnounceResponse> {
    let query = build_query(request, url.query());
    url.set_query(Some(&query));
    tracing::debug!(%url, "making announce request to tracker");

    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| TrackerError::Unreachable(e.to_string()))?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| TrackerError::Unreachable(e.to_string()))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| TrackerError::Unreachable(e.to_string()))?;
    parse_announce_response(&bytes)
}

/// Builds the announce query string. The binary fields are percent-encoded
/// by hand and spliced in verbatim; `Url::query_pairs_mut` would encode
/// the percent signs a second time.
fn build_query(request: &AnnounceRequest, existing: Option<&str>) -> String {
    let mut query = String::new();
    if let Some(existing) = existing {
        query.push_str(existing);
        query.push('&');
    }
    query.push_str(&format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        url_encode(&request.info_hash),
        url_encode(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
    ));
    if let Some(event) = request.event {
        query.push_str("&event=");
        query.push_str(event.query_value());
    }
    query
}

/// Percent-encodes a byte slice per RFC 3986: unreserved characters pass
/// through, everything else becomes `%XX`.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: i64,
    #[serde(default)]
    peers: Peers,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(serde_bytes::ByteBuf),
    NonCompact(Vec<PeerDict>),
}

impl Default for Peers {
    fn default() -> Self {
        Peers::Compact(serde_bytes::ByteBuf::new())
    }
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

/// Parses the bencoded tracker response, accepting both peer list forms:
/// compact (each peer is 4 address bytes and 2 port bytes, network order)
/// and the older list-of-dictionaries form.
fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    let response: TrackerResponse = serde_bencode::from_bytes(bytes)
        .map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;

    if let Some(reason) = response.failure_reason {
        return Err(TrackerError::Rejected(reason));
    }

    let peers = match response.peers {
        Peers::Compact(raw) => {
            if raw.len() % 6 != 0 {
                return Err(TrackerError::MalformedResponse(format!(
                    "compact peer string of {} bytes is not a multiple of 6",
                    raw.len()
                )));
            }
            raw.chunks_exact(6)
                .map(|chunk| Peer {
                    ip: IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
                    port: u16::from_be_bytes([chunk[4], chunk[5]]),
                })
                .collect()
        }
        Peers::NonCompact(dicts) => dicts
            .into_iter()
            .filter_map(|dict| {
                dict.ip.parse::<IpAddr>().ok().map(|ip| Peer {
                    ip,
                    port: dict.port,
                })
            })
            .collect(),
    };

    Ok(AnnounceResponse {
        interval: response.interval.clamp(0, u32::MAX as i64) as u32,
        peers,
    })
}
