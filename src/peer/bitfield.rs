//! Piece inventory bitfields.
//!
//! Bit 0 of byte 0 is the most significant bit: piece `i` lives in byte
//! `i / 8` under mask `0x80 >> (i % 8)`. Trailing bits past the piece
//! count must be zero on the wire.
use super::{PeerError, PeerResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    /// An all-zero bitfield for `num_pieces` pieces.
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bytes: vec![0u8; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Validates a wire bitfield: the length must be exactly
    /// `ceil(num_pieces / 8)` and trailing bits must be zero.
    pub fn from_bytes(bytes: Vec<u8>, num_pieces: usize) -> PeerResult<Self> {
        if bytes.len() != num_pieces.div_ceil(8) {
            return Err(PeerError::ProtocolViolation(format!(
                "bitfield of {} bytes for {} pieces",
                bytes.len(),
                num_pieces
            )));
        }
        let field = Self { bytes, num_pieces };
        for i in num_pieces..field.bytes.len() * 8 {
            if field.bit(i) {
                return Err(PeerError::ProtocolViolation(
                    "bitfield has non-zero trailing bits".to_string(),
                ));
            }
        }
        Ok(field)
    }

    fn bit(&self, index: usize) -> bool {
        self.bytes[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Whether the peer claims piece `index`. Out-of-range indices read
    /// as absent.
    pub fn has(&self, index: usize) -> bool {
        index < self.num_pieces && self.bit(index)
    }

    pub fn set(&mut self, index: usize) {
        if index < self.num_pieces {
            self.bytes[index / 8] |= 0x80 >> (index % 8);
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    /// Indices of all claimed pieces, ascending.
    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_pieces).filter(|&i| self.bit(i))
    }

    pub fn count(&self) -> usize {
        self.pieces().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msb_first_bit_order() {
        // 0b1010_0000: pieces 0 and 2
        let field = Bitfield::from_bytes(vec![0xA0], 4).unwrap();
        assert!(field.has(0));
        assert!(!field.has(1));
        assert!(field.has(2));
        assert!(!field.has(3));
        assert_eq!(field.pieces().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn set_and_read_back() {
        let mut field = Bitfield::new(10);
        field.set(9);
        assert!(field.has(9));
        assert_eq!(field.count(), 1);
    }

    #[test]
    fn out_of_range_reads_as_absent() {
        let field = Bitfield::from_bytes(vec![0xFF], 8).unwrap();
        assert!(!field.has(8));
        assert!(!field.has(1000));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            Bitfield::from_bytes(vec![0x00, 0x00], 8),
            Err(PeerError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn rejects_non_zero_trailing_bits() {
        // 10 pieces -> 2 bytes, 6 trailing bits; 0x20 sets piece 10
        assert!(matches!(
            Bitfield::from_bytes(vec![0x00, 0x20], 10),
            Err(PeerError::ProtocolViolation(_))
        ));
        assert!(Bitfield::from_bytes(vec![0xFF, 0xC0], 10).is_ok());
    }
}
