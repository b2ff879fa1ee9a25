//! Wire message framing.
//!
//! After the handshake every message is `<u32 length><u8 id><payload>`,
//! length zero being a keep-alive. Frames are read fully into memory, so
//! anything larger than a PIECE payload plus headroom is rejected before
//! allocation.
use super::{PeerError, PeerResult};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Request/response unit on the wire.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Frame cap: a full block plus the 13 bytes of PIECE framing and a
/// little headroom. Bitfields for huge torrents may legitimately exceed
/// this; [`Message::read_from`] takes the caller's cap for that reason.
pub const MAX_FRAME_LEN: usize = BLOCK_SIZE as usize + 13 + 256;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_EXTENDED: u8 = 20;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request {
        piece: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        piece: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        piece: u32,
        begin: u32,
        length: u32,
    },
    Extended {
        ext_id: u8,
        payload: Vec<u8>,
    },
    /// A message id we do not speak (DHT port, fast extension, ...).
    /// Tolerated and discarded rather than treated as a violation.
    Unknown(u8),
}

impl Message {
    /// Serializes the complete frame, length prefix included.
    pub fn frame(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(17);
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_header(&mut buf, 1, ID_CHOKE),
            Message::Unchoke => put_header(&mut buf, 1, ID_UNCHOKE),
            Message::Interested => put_header(&mut buf, 1, ID_INTERESTED),
            Message::NotInterested => put_header(&mut buf, 1, ID_NOT_INTERESTED),
            Message::Have(piece) => {
                put_header(&mut buf, 5, ID_HAVE);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bytes) => {
                put_header(&mut buf, 1 + bytes.len() as u32, ID_BITFIELD);
                buf.put_slice(bytes);
            }
            Message::Request {
                piece,
                begin,
                length,
            } => {
                put_header(&mut buf, 13, ID_REQUEST);
                buf.put_u32(*piece);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece {
                piece,
                begin,
                block,
            } => {
                put_header(&mut buf, 9 + block.len() as u32, ID_PIECE);
                buf.put_u32(*piece);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel {
                piece,
                begin,
                length,
            } => {
                put_header(&mut buf, 13, ID_CANCEL);
                buf.put_u32(*piece);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Extended { ext_id, payload } => {
                put_header(&mut buf, 2 + payload.len() as u32, ID_EXTENDED);
                buf.put_u8(*ext_id);
                buf.put_slice(payload);
            }
            Message::Unknown(id) => put_header(&mut buf, 1, *id),
        }
        buf.to_vec()
    }

    /// Parses a frame body (`id` byte plus payload, never empty).
    pub fn parse(body: &[u8]) -> PeerResult<Message> {
        let (id, payload) = body
            .split_first()
            .ok_or_else(|| PeerError::ProtocolViolation("empty frame body".to_string()))?;
        let msg = match *id {
            ID_CHOKE => expect_empty(payload, Message::Choke)?,
            ID_UNCHOKE => expect_empty(payload, Message::Unchoke)?,
            ID_INTERESTED => expect_empty(payload, Message::Interested)?,
            ID_NOT_INTERESTED => expect_empty(payload, Message::NotInterested)?,
            ID_HAVE => Message::Have(read_u32(payload, 0, "HAVE")?),
            ID_BITFIELD => Message::Bitfield(payload.to_vec()),
            ID_REQUEST => {
                check_len(payload, 12, "REQUEST")?;
                Message::Request {
                    piece: read_u32(payload, 0, "REQUEST")?,
                    begin: read_u32(payload, 4, "REQUEST")?,
                    length: read_u32(payload, 8, "REQUEST")?,
                }
            }
            ID_PIECE => {
                if payload.len() < 8 {
                    return Err(PeerError::ProtocolViolation(
                        "PIECE frame shorter than its header".to_string(),
                    ));
                }
                Message::Piece {
                    piece: read_u32(payload, 0, "PIECE")?,
                    begin: read_u32(payload, 4, "PIECE")?,
                    block: payload[8..].to_vec(),
                }
            }
            ID_CANCEL => {
                check_len(payload, 12, "CANCEL")?;
                Message::Cancel {
                    piece: read_u32(payload, 0, "CANCEL")?,
                    begin: read_u32(payload, 4, "CANCEL")?,
                    length: read_u32(payload, 8, "CANCEL")?,
                }
            }
            ID_EXTENDED => {
                let (ext_id, payload) = payload.split_first().ok_or_else(|| {
                    PeerError::ProtocolViolation("EXTENDED frame without ext id".to_string())
                })?;
                Message::Extended {
                    ext_id: *ext_id,
                    payload: payload.to_vec(),
                }
            }
            other => Message::Unknown(other),
        };
        Ok(msg)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.frame()).await
    }

    /// Reads one length-prefixed frame. `max_frame` is the largest body
    /// the caller will buffer; use [`MAX_FRAME_LEN`] adjusted for the
    /// torrent's bitfield size.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_frame: usize,
    ) -> PeerResult<Message> {
        let mut length_buf = [0u8; 4];
        reader.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf) as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if length > max_frame {
            return Err(PeerError::ProtocolViolation(format!(
                "frame of {length} bytes exceeds the {max_frame}-byte cap"
            )));
        }
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        Message::parse(&body)
    }
}

fn put_header(buf: &mut BytesMut, length: u32, id: u8) {
    buf.put_u32(length);
    buf.put_u8(id);
}

fn expect_empty(payload: &[u8], msg: Message) -> PeerResult<Message> {
    if payload.is_empty() {
        Ok(msg)
    } else {
        Err(PeerError::ProtocolViolation(format!(
            "{msg:?} carries an unexpected payload"
        )))
    }
}

fn check_len(payload: &[u8], expected: usize, name: &str) -> PeerResult<()> {
    if payload.len() != expected {
        return Err(PeerError::ProtocolViolation(format!(
            "{name} payload of {} bytes instead of {expected}",
            payload.len()
        )));
    }
    Ok(())
}

fn read_u32(payload: &[u8], offset: usize, name: &str) -> PeerResult<u32> {
    let bytes: [u8; 4] = payload
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| PeerError::ProtocolViolation(format!("truncated {name} payload")))?;
    Ok(u32::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let frame = msg.frame();
        let body = &frame[4..];
        assert_eq!(Message::parse(body).unwrap(), msg);
        // length prefix covers exactly the body
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, body.len());
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have(7));
        round_trip(Message::Bitfield(vec![0xA0, 0x01]));
        round_trip(Message::Request {
            piece: 1,
            begin: 16384,
            length: 16384,
        });
        round_trip(Message::Piece {
            piece: 1,
            begin: 16384,
            block: vec![1, 2, 3],
        });
        round_trip(Message::Cancel {
            piece: 1,
            begin: 0,
            length: 16384,
        });
        round_trip(Message::Extended {
            ext_id: 3,
            payload: b"d1:ai1ee".to_vec(),
        });
    }

    #[test]
    fn keep_alive_is_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.frame(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn have_frame_layout() {
        assert_eq!(
            Message::Have(0x01020304).frame(),
            vec![0, 0, 0, 5, 4, 1, 2, 3, 4]
        );
    }

    #[test]
    fn rejects_wrong_fixed_lengths() {
        assert!(matches!(
            Message::parse(&[ID_HAVE, 0, 0]),
            Err(PeerError::ProtocolViolation(_))
        ));
        assert!(matches!(
            Message::parse(&[ID_REQUEST, 0, 0, 0, 1]),
            Err(PeerError::ProtocolViolation(_))
        ));
        assert!(matches!(
            Message::parse(&[ID_CHOKE, 9]),
            Err(PeerError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn unknown_ids_are_tolerated() {
        assert_eq!(Message::parse(&[9, 0x1A, 0xE1]).unwrap(), Message::Unknown(9));
    }

    #[tokio::test]
    async fn reads_and_writes_over_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let msg = Message::Piece {
            piece: 3,
            begin: 0,
            block: vec![9u8; 32],
        };
        msg.write_to(&mut client).await.unwrap();
        let received = Message::read_from(&mut server, MAX_FRAME_LEN).await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn oversize_frames_are_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(10 * 1024 * 1024u32).to_be_bytes())
            .await
            .unwrap();
        let err = Message::read_from(&mut server, MAX_FRAME_LEN).await;
        assert!(matches!(err, Err(PeerError::ProtocolViolation(_))));
    }
}
