use super::BencodeResult;
use super::Value;
use std::collections::BTreeMap;
use std::io::Write;
use tracing::instrument;

/// Encodes a byte slice as a bencode string: `<length>:<bytes>`.
fn encode_bytes<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

/// Encodes an integer as `i<value>e`.
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

fn encode_list<W: Write>(writer: &mut W, list: &[Value]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

/// Encodes a dictionary. The map already holds its keys in lexicographic
/// order, which is the only order the format permits.
fn encode_dict<W: Write>(writer: &mut W, dict: &BTreeMap<Vec<u8>, Value>) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict {
        encode_bytes(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

fn encode_value<W: Write>(writer: &mut W, value: &Value) -> BencodeResult<()> {
    match value {
        Value::Bytes(s) => encode_bytes(writer, s),
        Value::Integer(i) => encode_integer(writer, *i),
        Value::List(list) => encode_list(writer, list),
        Value::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes a [`Value`] into its bencode representation.
///
/// The encoding is deterministic and bit-exact: for any value there is
/// exactly one serialization, so `encode(decode(b)) == b` for every
/// well-formed input `b`.
#[instrument(skip(writer, value), level = "trace")]
pub fn encode<W: Write>(writer: &mut W, value: &Value) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Convenience wrapper returning the encoding as a fresh vector.
pub fn encode_to_vec(value: &Value) -> BencodeResult<Vec<u8>> {
    let mut buffer = Vec::new();
    encode(&mut buffer, value)?;
    Ok(buffer)
}
