//! Piece state table.
//!
//! Pure bookkeeping for every piece of the torrent: availability counts
//! across the swarm, rarest-first selection, per-block issue/receive
//! flags, buffer assembly and SHA-1 verification. The scheduler task
//! drives this from its event loop; nothing in here touches a socket or
//! a channel.
use crate::peer::{Bitfield, BlockRequest, PeerIndex};
use crate::torrent::info_hash::sha1_digest;
use std::collections::HashSet;

#[derive(Debug)]
pub(crate) enum PieceState {
    Missing,
    InFlight(InFlight),
    Complete,
}

#[derive(Debug)]
pub(crate) struct InFlight {
    buf: Vec<u8>,
    /// Per-block flags, indexed by `begin / block_size`.
    received: Vec<bool>,
    issued: Vec<bool>,
    received_count: usize,
    /// Peers currently assigned to this piece.
    pub assigned: HashSet<PeerIndex>,
    /// Every peer that supplied at least one block, for demerits when the
    /// piece fails verification.
    contributors: HashSet<PeerIndex>,
}

impl InFlight {
    fn has_free_block(&self) -> bool {
        self.received
            .iter()
            .zip(&self.issued)
            .any(|(received, issued)| !received && !issued)
    }
}

/// What became of an incoming block.
#[derive(Debug)]
pub(crate) enum BlockOutcome {
    /// Unsolicited, duplicate, out of range or stale. Dropped without
    /// error.
    Ignored,
    /// Accepted; the piece still has blocks outstanding.
    Stored,
    /// The block completed the piece and the SHA-1 matched. The buffer is
    /// handed out for storage and the piece is immutable from here on.
    Verified(Vec<u8>),
    /// The assembled piece failed verification; it was reset to missing
    /// and these peers contributed to the bad assembly.
    HashMismatch(Vec<PeerIndex>),
}

pub(crate) struct PieceTable {
    hashes: Vec<[u8; 20]>,
    piece_length: u64,
    total_length: u64,
    block_size: u32,
    pieces: Vec<PieceState>,
    /// How many connected peers claim each piece.
    availability: Vec<u32>,
    done: usize,
    done_bytes: u64,
}

impl PieceTable {
    pub fn new(
        hashes: Vec<[u8; 20]>,
        piece_length: u64,
        total_length: u64,
        block_size: u32,
    ) -> Self {
        let count = hashes.len();
        let mut pieces = Vec::with_capacity(count);
        pieces.resize_with(count, || PieceState::Missing);
        Self {
            hashes,
            piece_length,
            total_length,
            block_size,
            pieces,
            availability: vec![0; count],
            done: 0,
            done_bytes: 0,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn done(&self) -> usize {
        self.done
    }

    pub fn done_bytes(&self) -> u64 {
        self.done_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_length
    }

    pub fn is_complete(&self) -> bool {
        self.done == self.pieces.len()
    }

    pub fn piece_size(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_length);
        end.saturating_sub(start) as u32
    }

    fn num_blocks(&self, index: u32) -> usize {
        (self.piece_size(index) as usize).div_ceil(self.block_size as usize)
    }

    pub fn add_availability(&mut self, bitfield: &Bitfield) {
        for piece in bitfield.pieces() {
            self.availability[piece] += 1;
        }
    }

    pub fn remove_availability(&mut self, bitfield: &Bitfield) {
        for piece in bitfield.pieces() {
            self.availability[piece] = self.availability[piece].saturating_sub(1);
        }
    }

    pub fn inc_availability(&mut self, index: u32) {
        if let Some(count) = self.availability.get_mut(index as usize) {
            *count += 1;
        }
    }

    /// Whether the peer has anything we still need, i.e. whether we should
    /// be interested in it.
    pub fn wants_any(&self, bitfield: &Bitfield) -> bool {
        bitfield
            .pieces()
            .any(|piece| !matches!(self.pieces[piece], PieceState::Complete))
    }

    /// Rarest-first piece selection for one peer.
    ///
    /// The primary pass considers pieces nobody is working: missing ones,
    /// plus in-flight pieces whose assignees all went away. Only when the
    /// peer has none of those left does the tail pass let it join a piece
    /// another peer is already on, capped at `saturation` peers per piece.
    /// Both passes minimise swarm availability and break ties on the lower
    /// index.
    pub fn pick_for(
        &self,
        bitfield: &Bitfield,
        assigned_to_peer: &HashSet<u32>,
        saturation: usize,
    ) -> Option<u32> {
        // (availability, index): tuple order gives rarest-first with the
        // lower index breaking ties
        let mut best: Option<(u32, u32)> = None;

        for index in 0..self.pieces.len() {
            if !bitfield.has(index) {
                continue;
            }
            let orphaned = match &self.pieces[index] {
                PieceState::Missing => true,
                PieceState::InFlight(flight) => {
                    flight.assigned.is_empty() && flight.has_free_block()
                }
                PieceState::Complete => continue,
            };
            if orphaned {
                consider(&mut best, self.availability[index], index as u32);
            }
        }
        if let Some((_, index)) = best {
            return Some(index);
        }

        for index in 0..self.pieces.len() {
            if !bitfield.has(index) || assigned_to_peer.contains(&(index as u32)) {
                continue;
            }
            if let PieceState::InFlight(flight) = &self.pieces[index] {
                if flight.assigned.len() < saturation && flight.has_free_block() {
                    consider(&mut best, self.availability[index], index as u32);
                }
            }
        }
        best.map(|(_, index)| index)
    }

    /// Assigns `peer` to a piece, allocating the in-flight buffers when
    /// the piece was missing.
    pub fn assign(&mut self, index: u32, peer: PeerIndex) {
        let blocks = self.num_blocks(index);
        let size = self.piece_size(index) as usize;
        match &mut self.pieces[index as usize] {
            state @ PieceState::Missing => {
                let mut flight = InFlight {
                    buf: vec![0u8; size],
                    received: vec![false; blocks],
                    issued: vec![false; blocks],
                    received_count: 0,
                    assigned: HashSet::new(),
                    contributors: HashSet::new(),
                };
                flight.assigned.insert(peer);
                *state = PieceState::InFlight(flight);
            }
            PieceState::InFlight(flight) => {
                flight.assigned.insert(peer);
            }
            PieceState::Complete => {}
        }
    }

    pub fn unassign(&mut self, index: u32, peer: PeerIndex) {
        if let PieceState::InFlight(flight) = &mut self.pieces[index as usize] {
            flight.assigned.remove(&peer);
        }
    }

    /// Hands out the lowest unrequested block of an in-flight piece, in
    /// ascending `begin` order, and marks it issued.
    pub fn next_block(&mut self, index: u32) -> Option<BlockRequest> {
        let piece_size = self.piece_size(index);
        let block_size = self.block_size;
        let PieceState::InFlight(flight) = &mut self.pieces[index as usize] else {
            return None;
        };
        let block = flight
            .received
            .iter()
            .zip(&flight.issued)
            .position(|(received, issued)| !received && !issued)?;
        flight.issued[block] = true;

        let begin = block as u32 * block_size;
        Some(BlockRequest {
            piece: index,
            begin,
            length: block_size.min(piece_size - begin),
        })
    }

    /// Returns a forfeited block (choke, timeout, disconnect) to the
    /// issuable pool.
    pub fn release_block(&mut self, index: u32, begin: u32) {
        let block = (begin / self.block_size) as usize;
        if let PieceState::InFlight(flight) = &mut self.pieces[index as usize] {
            if let Some(issued) = flight.issued.get_mut(block) {
                if !flight.received[block] {
                    *issued = false;
                }
            }
        }
    }

    /// Places a solicited block into its piece buffer. The caller has
    /// already matched `(index, begin)` against an outstanding request;
    /// this guards the buffer bounds and duplicate delivery, and runs
    /// verification when the last block lands.
    pub fn record_block(
        &mut self,
        index: u32,
        begin: u32,
        data: &[u8],
        peer: PeerIndex,
    ) -> BlockOutcome {
        let piece_size = self.piece_size(index) as usize;
        let block_size = self.block_size;
        let expected_hash = self.hashes[index as usize];

        let PieceState::InFlight(flight) = &mut self.pieces[index as usize] else {
            return BlockOutcome::Ignored;
        };

        let begin = begin as usize;
        let block = begin / block_size as usize;
        if begin % block_size as usize != 0
            || block >= flight.received.len()
            || begin + data.len() > piece_size
        {
            return BlockOutcome::Ignored;
        }
        if flight.received[block] {
            return BlockOutcome::Ignored;
        }

        flight.buf[begin..begin + data.len()].copy_from_slice(data);
        flight.received[block] = true;
        flight.issued[block] = true;
        flight.received_count += 1;
        flight.contributors.insert(peer);

        if flight.received_count < flight.received.len() {
            return BlockOutcome::Stored;
        }

        // last block: verify the assembly
        if sha1_digest(&flight.buf) == expected_hash {
            let buf = std::mem::take(&mut flight.buf);
            self.pieces[index as usize] = PieceState::Complete;
            self.done += 1;
            self.done_bytes += piece_size as u64;
            BlockOutcome::Verified(buf)
        } else {
            let contributors = flight.contributors.iter().copied().collect();
            self.pieces[index as usize] = PieceState::Missing;
            BlockOutcome::HashMismatch(contributors)
        }
    }

}

fn consider(best: &mut Option<(u32, u32)>, availability: u32, index: u32) {
    if best.is_none_or(|current| (availability, index) < current) {
        *best = Some((availability, index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: u32 = 16 * 1024;

    fn bitfield_with(pieces: &[usize], total: usize) -> Bitfield {
        let mut field = Bitfield::new(total);
        for &piece in pieces {
            field.set(piece);
        }
        field
    }

    /// One 32 KiB piece made of two full blocks.
    fn one_piece_table(content: &[u8]) -> PieceTable {
        PieceTable::new(
            vec![sha1_digest(content)],
            content.len() as u64,
            content.len() as u64,
            BLOCK,
        )
    }

    #[test]
    fn blocks_delivered_in_reverse_order_still_verify() {
        let content = vec![0x5Au8; 32 * 1024];
        let mut table = one_piece_table(&content);
        table.assign(0, 1);

        // issue both blocks, then deliver the second before the first
        let first = table.next_block(0).unwrap();
        let second = table.next_block(0).unwrap();
        assert_eq!((first.begin, second.begin), (0, BLOCK));
        assert_eq!(second.length, BLOCK);

        assert!(matches!(
            table.record_block(0, second.begin, &content[BLOCK as usize..], 1),
            BlockOutcome::Stored
        ));
        match table.record_block(0, first.begin, &content[..BLOCK as usize], 1) {
            BlockOutcome::Verified(buf) => assert_eq!(buf, content),
            other => panic!("expected Verified, got {other:?}"),
        }
        assert!(table.is_complete());
        assert_eq!(table.done_bytes(), 32 * 1024);
    }

    #[test]
    fn corrupt_piece_resets_and_names_contributors() {
        let content = vec![0x5Au8; 32 * 1024];
        let mut table = one_piece_table(&content);
        table.assign(0, 7);
        table.next_block(0).unwrap();
        table.next_block(0).unwrap();

        let mut corrupted = content.clone();
        corrupted[12] ^= 0x01;
        table.record_block(0, 0, &corrupted[..BLOCK as usize], 7);
        match table.record_block(0, BLOCK, &corrupted[BLOCK as usize..], 7) {
            BlockOutcome::HashMismatch(contributors) => assert_eq!(contributors, vec![7]),
            other => panic!("expected HashMismatch, got {other:?}"),
        }

        // fully reset: re-assignable from scratch
        assert_eq!(table.done(), 0);
        assert!(matches!(table.pieces[0], PieceState::Missing));
        table.assign(0, 8);
        assert_eq!(table.next_block(0).unwrap().begin, 0);
    }

    #[test]
    fn final_block_is_clamped_to_the_piece() {
        // 20 KiB piece: one full block and a 4 KiB tail
        let content = vec![1u8; 20 * 1024];
        let mut table = one_piece_table(&content);
        table.assign(0, 1);
        let first = table.next_block(0).unwrap();
        let tail = table.next_block(0).unwrap();
        assert_eq!(first.length, BLOCK);
        assert_eq!(tail.begin, BLOCK);
        assert_eq!(tail.length, 4 * 1024);
        assert!(table.next_block(0).is_none());
    }

    #[test]
    fn rarest_first_prefers_low_availability_then_low_index() {
        // three peers: {0,1}, {1,2}, {2} -> availability [1, 2, 2]
        let mut table = PieceTable::new(
            vec![[0u8; 20]; 3],
            4,
            12,
            BLOCK,
        );
        let peer_a = bitfield_with(&[0, 1], 3);
        let peer_b = bitfield_with(&[1, 2], 3);
        let peer_c = bitfield_with(&[2], 3);
        table.add_availability(&peer_a);
        table.add_availability(&peer_b);
        table.add_availability(&peer_c);
        assert_eq!(table.availability, vec![1, 2, 2]);

        // peer A gets piece 0: it is the rarest one A advertises
        assert_eq!(table.pick_for(&peer_a, &HashSet::new(), 8), Some(0));
        table.assign(0, 1);

        // peer B ties availability between 1 and 2, lower index wins
        assert_eq!(table.pick_for(&peer_b, &HashSet::new(), 8), Some(1));
        table.assign(1, 2);

        // peer C only has piece 2
        assert_eq!(table.pick_for(&peer_c, &HashSet::new(), 8), Some(2));
    }

    #[test]
    fn tail_pass_joins_unsaturated_pieces_only() {
        let mut table = PieceTable::new(vec![[0u8; 20]; 1], 32 * 1024, 32 * 1024, BLOCK);
        let everything = bitfield_with(&[0], 1);
        table.assign(0, 1);

        // piece 0 is in flight for peer 1 with free blocks left: a second
        // peer may join, but only via the tail pass and under the cap
        let mut mine = HashSet::new();
        assert_eq!(table.pick_for(&everything, &mine, 8), Some(0));
        mine.insert(0);
        assert_eq!(table.pick_for(&everything, &mine, 8), None);

        // saturation cap of one peer blocks the join entirely
        assert_eq!(table.pick_for(&everything, &HashSet::new(), 1), None);
    }

    #[test]
    fn orphaned_pieces_are_first_class_again() {
        let content = vec![3u8; 32 * 1024];
        let mut table = one_piece_table(&content);
        table.assign(0, 1);
        let request = table.next_block(0).unwrap();
        table.record_block(0, request.begin, &content[..BLOCK as usize], 1);

        // peer 1 vanishes with the second block issued but unanswered
        let _ = table.next_block(0);
        table.unassign(0, 1);
        table.release_block(0, BLOCK);

        let everything = bitfield_with(&[0], 1);
        assert_eq!(table.pick_for(&everything, &HashSet::new(), 8), Some(0));
    }

    #[test]
    fn unsolicited_and_duplicate_blocks_are_ignored() {
        let content = vec![9u8; 32 * 1024];
        let mut table = one_piece_table(&content);

        // piece not in flight at all
        assert!(matches!(
            table.record_block(0, 0, &content[..BLOCK as usize], 1),
            BlockOutcome::Ignored
        ));

        table.assign(0, 1);
        table.next_block(0).unwrap();
        table.record_block(0, 0, &content[..BLOCK as usize], 1);
        // same block again
        assert!(matches!(
            table.record_block(0, 0, &content[..BLOCK as usize], 1),
            BlockOutcome::Ignored
        ));
        // out of range
        assert!(matches!(
            table.record_block(0, 48 * 1024, &[0u8; 16], 1),
            BlockOutcome::Ignored
        ));
        // misaligned begin
        assert!(matches!(
            table.record_block(0, 3, &[0u8; 16], 1),
            BlockOutcome::Ignored
        ));
    }

    #[test]
    fn interest_follows_need() {
        let mut table = PieceTable::new(vec![[0u8; 20]; 2], 4, 8, BLOCK);
        let only_zero = bitfield_with(&[0], 2);
        assert!(table.wants_any(&only_zero));
        table.pieces[0] = PieceState::Complete;
        table.done += 1;
        assert!(!table.wants_any(&only_zero));
    }
}
