//! Bencode codec.
//!
//! B-encoding is the serialization used by metainfo files, tracker
//! responses and the peer extension protocol. This module provides the
//! dynamic [`Value`] type, strict and lenient decoding, and a
//! deterministic encoder whose output is the sole valid serialization of
//! any value.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

pub use decoder::{decode, decode_lenient, decode_prefix, info_span};
pub use encoder::{encode, encode_to_vec};

/// A parsed bencode value.
///
/// Byte strings are opaque bytes, not text; real torrents carry raw SHA-1
/// digests in them. Dictionary keys are held in a `BTreeMap`, i.e. in
/// lexicographic byte order, which is exactly the order a well-formed
/// document stores them in and makes re-encoding reproduce the input
/// byte-for-byte.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Value {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// UTF-8 view of a byte string, when it happens to be text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Custom error type for bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bencode: {0}")]
    Malformed(String),

    #[error("invalid integer literal")]
    InvalidInteger,

    #[error("invalid string length prefix")]
    InvalidLength,

    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("duplicate dictionary key")]
    DuplicateKey,

    #[error("dictionary keys not in ascending order")]
    UnsortedKeys,

    #[error("{0} trailing bytes after top-level value")]
    TrailingBytes(usize),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
