//! Extension protocol payloads (BEP 10) and ut_metadata (BEP 9).
//!
//! EXTENDED messages with ext id 0 carry the extension handshake: a
//! dictionary advertising, under `m`, which named extensions the sender
//! speaks and which local ids it picked for them. ut_metadata then moves
//! the info dictionary in 16 KiB pieces, each data message being a
//! bencoded header with the raw piece bytes appended.
use crate::bencode::{self, BencodeResult, Value};
use std::collections::BTreeMap;

use super::{PeerError, PeerResult};

/// Ext id of the extension handshake itself.
pub const HANDSHAKE_EXT_ID: u8 = 0;

/// The id we advertise for ut_metadata; peers address their data and
/// reject messages to us with it.
pub const UT_METADATA_ID: u8 = 1;

/// Metadata is exchanged in pieces of this size, the last one short.
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

const MSG_TYPE_REQUEST: i64 = 0;
const MSG_TYPE_DATA: i64 = 1;
const MSG_TYPE_REJECT: i64 = 2;

/// The decoded extension handshake fields we care about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtendedHandshake {
    /// The peer's local id for ut_metadata, if it speaks it.
    pub ut_metadata: Option<u8>,
    /// Size of the info dictionary in bytes.
    pub metadata_size: Option<u64>,
}

impl ExtendedHandshake {
    /// Our outgoing handshake: `{"m": {"ut_metadata": 1}, "v": ...}`.
    pub fn ours() -> Self {
        Self {
            ut_metadata: Some(UT_METADATA_ID),
            metadata_size: None,
        }
    }

    pub fn to_bytes(&self) -> BencodeResult<Vec<u8>> {
        let mut m = BTreeMap::new();
        if let Some(id) = self.ut_metadata {
            m.insert(b"ut_metadata".to_vec(), Value::Integer(id as i64));
        }
        let mut dict = BTreeMap::new();
        dict.insert(b"m".to_vec(), Value::Dict(m));
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), Value::Integer(size as i64));
        }
        dict.insert(
            b"v".to_vec(),
            Value::Bytes(b"swarmfetch 0.1".to_vec()),
        );
        bencode::encode_to_vec(&Value::Dict(dict))
    }

    /// Parses a peer's extension handshake. Decoding is lenient: plenty
    /// of clients emit these dictionaries with unsorted keys.
    pub fn from_bytes(payload: &[u8]) -> PeerResult<Self> {
        let (value, _) = bencode::decode_prefix(payload)?;
        let dict = value.as_dict().ok_or_else(|| {
            PeerError::ProtocolViolation("extension handshake is not a dictionary".to_string())
        })?;

        let ut_metadata = dict
            .get(b"m".as_slice())
            .and_then(Value::as_dict)
            .and_then(|m| m.get(b"ut_metadata".as_slice()))
            .and_then(Value::as_int)
            .and_then(|id| u8::try_from(id).ok());
        let metadata_size = dict
            .get(b"metadata_size".as_slice())
            .and_then(Value::as_int)
            .and_then(|size| u64::try_from(size).ok());

        Ok(Self {
            ut_metadata,
            metadata_size,
        })
    }
}

/// A ut_metadata message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u64, data: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn to_bytes(&self) -> BencodeResult<Vec<u8>> {
        let mut dict = BTreeMap::new();
        let (msg_type, piece) = match self {
            MetadataMessage::Request { piece } => (MSG_TYPE_REQUEST, *piece),
            MetadataMessage::Data {
                piece, total_size, ..
            } => {
                dict.insert(
                    b"total_size".to_vec(),
                    Value::Integer(*total_size as i64),
                );
                (MSG_TYPE_DATA, *piece)
            }
            MetadataMessage::Reject { piece } => (MSG_TYPE_REJECT, *piece),
        };
        dict.insert(b"msg_type".to_vec(), Value::Integer(msg_type));
        dict.insert(b"piece".to_vec(), Value::Integer(piece as i64));

        let mut bytes = bencode::encode_to_vec(&Value::Dict(dict))?;
        if let MetadataMessage::Data { data, .. } = self {
            bytes.extend_from_slice(data);
        }
        Ok(bytes)
    }

    /// Parses a ut_metadata payload. For data messages the raw piece
    /// bytes start right where the bencoded header ends.
    pub fn from_bytes(payload: &[u8]) -> PeerResult<MetadataMessage> {
        let (value, consumed) = bencode::decode_prefix(payload)?;
        let dict = value.as_dict().ok_or_else(|| {
            PeerError::ProtocolViolation("ut_metadata header is not a dictionary".to_string())
        })?;

        let msg_type = dict
            .get(b"msg_type".as_slice())
            .and_then(Value::as_int)
            .ok_or_else(|| {
                PeerError::ProtocolViolation("ut_metadata header without msg_type".to_string())
            })?;
        let piece = dict
            .get(b"piece".as_slice())
            .and_then(Value::as_int)
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| {
                PeerError::ProtocolViolation("ut_metadata header without piece".to_string())
            })?;

        match msg_type {
            MSG_TYPE_REQUEST => Ok(MetadataMessage::Request { piece }),
            MSG_TYPE_DATA => {
                let total_size = dict
                    .get(b"total_size".as_slice())
                    .and_then(Value::as_int)
                    .and_then(|s| u64::try_from(s).ok())
                    .ok_or_else(|| {
                        PeerError::ProtocolViolation(
                            "ut_metadata data message without total_size".to_string(),
                        )
                    })?;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: payload[consumed..].to_vec(),
                })
            }
            MSG_TYPE_REJECT => Ok(MetadataMessage::Reject { piece }),
            other => Err(PeerError::ProtocolViolation(format!(
                "unknown ut_metadata msg_type {other}"
            ))),
        }
    }
}
