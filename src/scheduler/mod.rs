//! The piece scheduler.
//!
//! One task owns all download bookkeeping: which peer has which pieces,
//! which blocks are outstanding where, and what has been verified. Peers
//! talk to it exclusively through their event channel and it talks back
//! through per-peer command channels, so there is no shared mutable state
//! anywhere in the pipeline. Completed pieces are handed to the storage
//! writer and announced to the swarm with HAVE messages.
use crate::config::Config;
use crate::peer::{Bitfield, BlockRequest, PeerCommand, PeerEvent, PeerIndex};
use crate::progress::{ProgressEvent, ProgressSnapshot};
use crate::storage::StorageCommand;
use crate::torrent::Metainfo;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};

mod pieces;
use pieces::{BlockOutcome, PieceTable};

/// Outstanding requests older than this are forfeited and reissued
/// through another peer.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Hash-failing assemblies a peer may contribute to before it is dropped.
const DEMERIT_LIMIT: u32 = 3;

/// Why the scheduler task ended.
#[derive(Debug, PartialEq, Eq)]
pub enum SchedulerExit {
    /// Every piece verified and enqueued for storage.
    Complete,
    /// The storage writer went away; its join handle has the real error.
    StorageClosed,
    /// Every peer disconnected with pieces still missing.
    PeersExhausted,
    /// Shutdown was signalled.
    Interrupted,
}

#[derive(Debug)]
struct Pending {
    length: u32,
    issued_at: Instant,
}

/// Scheduler-side view of one connected peer.
struct PeerSlot {
    commands: mpsc::Sender<PeerCommand>,
    bitfield: Bitfield,
    /// peer_choking: requests may only flow while this is false.
    choked: bool,
    /// am_interested, as last told to the peer.
    interested: bool,
    outstanding: HashMap<(u32, u32), Pending>,
    assigned: HashSet<u32>,
    demerits: u32,
}

pub struct Scheduler {
    cfg: Config,
    table: PieceTable,
    peers: HashMap<PeerIndex, PeerSlot>,
    events: mpsc::Receiver<PeerEvent>,
    storage: mpsc::Sender<StorageCommand>,
    progress: broadcast::Sender<ProgressEvent>,
    peers_total_seen: usize,
    started: Instant,
    last_bytes: u64,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        metainfo: &Metainfo,
        events: mpsc::Receiver<PeerEvent>,
        storage: mpsc::Sender<StorageCommand>,
        progress: broadcast::Sender<ProgressEvent>,
        peers_total_seen: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let table = PieceTable::new(
            metainfo.piece_hashes.clone(),
            metainfo.info.piece_length,
            metainfo.total_length(),
            cfg.block_size,
        );
        Self {
            cfg,
            table,
            peers: HashMap::new(),
            events,
            storage,
            progress,
            peers_total_seen,
            started: Instant::now(),
            last_bytes: 0,
            shutdown,
        }
    }

    /// Runs the event loop until the download completes, the swarm dries
    /// up, storage dies, or shutdown is signalled.
    #[tracing::instrument(level = "debug", skip(self), fields(pieces = self.table.num_pieces()))]
    pub async fn run(mut self) -> SchedulerExit {
        let mut progress_tick = tokio::time::interval(PROGRESS_INTERVAL);
        let mut sweep_tick = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            if self.table.is_complete() {
                self.emit_progress();
                self.shutdown_peers().await;
                return SchedulerExit::Complete;
            }

            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        if self.handle_event(event).await.is_err() {
                            return SchedulerExit::StorageClosed;
                        }
                    }
                    None => {
                        tracing::warn!(
                            done = self.table.done(),
                            total = self.table.num_pieces(),
                            "all peers gone before completion"
                        );
                        return SchedulerExit::PeersExhausted;
                    }
                },
                _ = progress_tick.tick() => self.emit_progress(),
                _ = sweep_tick.tick() => self.sweep_timeouts().await,
                _ = self.shutdown.changed() => {
                    self.shutdown_peers().await;
                    return SchedulerExit::Interrupted;
                }
            }
        }
    }

    /// `Err` means the storage writer is gone and the session must abort.
    async fn handle_event(&mut self, event: PeerEvent) -> Result<(), ()> {
        match event {
            PeerEvent::Connected { peer, commands } => {
                let num_pieces = self.table.num_pieces();
                self.peers.insert(
                    peer,
                    PeerSlot {
                        commands,
                        bitfield: Bitfield::new(num_pieces),
                        choked: true,
                        interested: false,
                        outstanding: HashMap::new(),
                        assigned: HashSet::new(),
                        demerits: 0,
                    },
                );
            }
            PeerEvent::Bitfield { peer, bitfield } => {
                let Some(slot) = self.peers.get_mut(&peer) else {
                    return Ok(());
                };
                self.table.remove_availability(&slot.bitfield);
                self.table.add_availability(&bitfield);
                slot.bitfield = bitfield;
                self.update_interest(peer).await;
            }
            PeerEvent::Have { peer, piece } => {
                let Some(slot) = self.peers.get_mut(&peer) else {
                    return Ok(());
                };
                if !slot.bitfield.has(piece as usize) {
                    slot.bitfield.set(piece as usize);
                    self.table.inc_availability(piece);
                }
                self.update_interest(peer).await;
                self.fill_requests(peer).await;
            }
            PeerEvent::Unchoked { peer } => {
                if let Some(slot) = self.peers.get_mut(&peer) {
                    slot.choked = false;
                }
                self.fill_requests(peer).await;
            }
            PeerEvent::Choked { peer } => {
                // every outstanding request to this peer is forfeit; the
                // released blocks become issuable elsewhere immediately
                self.forfeit_requests(peer, true);
                self.fill_all().await;
            }
            PeerEvent::BlockReceived {
                peer,
                piece,
                begin,
                data,
            } => return self.handle_block(peer, piece, begin, data).await,
            PeerEvent::Disconnected { peer } => {
                if let Some(slot) = self.peers.remove(&peer) {
                    self.table.remove_availability(&slot.bitfield);
                    for ((piece, begin), _) in slot.outstanding {
                        self.table.release_block(piece, begin);
                    }
                    for piece in slot.assigned {
                        self.table.unassign(piece, peer);
                    }
                    self.fill_all().await;
                }
            }
        }
        Ok(())
    }

    async fn handle_block(
        &mut self,
        peer: PeerIndex,
        piece: u32,
        begin: u32,
        data: Vec<u8>,
    ) -> Result<(), ()> {
        let Some(slot) = self.peers.get_mut(&peer) else {
            return Ok(());
        };
        let Some(pending) = slot.outstanding.remove(&(piece, begin)) else {
            tracing::trace!(peer, piece, begin, "unsolicited block discarded");
            return Ok(());
        };
        if pending.length as usize != data.len() {
            tracing::debug!(
                peer,
                piece,
                begin,
                got = data.len(),
                asked = pending.length,
                "block with the wrong length discarded"
            );
            self.table.release_block(piece, begin);
            return Ok(());
        }

        match self.table.record_block(piece, begin, &data, peer) {
            BlockOutcome::Ignored => {}
            BlockOutcome::Stored => self.fill_requests(peer).await,
            BlockOutcome::Verified(bytes) => {
                tracing::debug!(piece, "piece verified");
                for slot in self.peers.values_mut() {
                    slot.assigned.remove(&piece);
                }
                if self
                    .storage
                    .send(StorageCommand::WritePiece {
                        index: piece,
                        data: bytes,
                    })
                    .await
                    .is_err()
                {
                    return Err(());
                }
                self.broadcast_have(piece).await;
                self.refresh_interest().await;
                self.fill_all().await;
            }
            BlockOutcome::HashMismatch(contributors) => {
                tracing::warn!(piece, "piece failed hash verification, rescheduling");
                for slot in self.peers.values_mut() {
                    slot.assigned.remove(&piece);
                }
                for contributor in contributors {
                    self.demerit(contributor).await;
                }
                self.fill_all().await;
            }
        }
        Ok(())
    }

    /// Tops up one peer's request pipeline, assigning new pieces as
    /// capacity allows, and ships the batch to its writer.
    async fn fill_requests(&mut self, peer: PeerIndex) {
        let batch = self.plan_requests(peer);
        if batch.is_empty() {
            return;
        }
        if let Some(slot) = self.peers.get(&peer) {
            let _ = slot
                .commands
                .send(PeerCommand::IssueRequests(batch))
                .await;
        }
    }

    fn plan_requests(&mut self, peer: PeerIndex) -> Vec<BlockRequest> {
        let Self {
            peers, table, cfg, ..
        } = self;
        let mut batch = Vec::new();
        let Some(slot) = peers.get_mut(&peer) else {
            return batch;
        };
        if slot.choked || !slot.interested {
            return batch;
        }

        while slot.outstanding.len() < cfg.pipeline_depth {
            let mut request = None;
            for &piece in &slot.assigned {
                if let Some(found) = table.next_block(piece) {
                    request = Some(found);
                    break;
                }
            }
            let request = match request {
                Some(request) => request,
                None => {
                    if slot.assigned.len() >= cfg.pieces_per_peer {
                        break;
                    }
                    let Some(piece) =
                        table.pick_for(&slot.bitfield, &slot.assigned, cfg.pieces_per_peer)
                    else {
                        break;
                    };
                    table.assign(piece, peer);
                    slot.assigned.insert(piece);
                    match table.next_block(piece) {
                        Some(request) => request,
                        None => break,
                    }
                }
            };
            slot.outstanding.insert(
                (request.piece, request.begin),
                Pending {
                    length: request.length,
                    issued_at: Instant::now(),
                },
            );
            batch.push(request);
        }
        batch
    }

    async fn fill_all(&mut self) {
        let requestable: Vec<PeerIndex> = self
            .peers
            .iter()
            .filter(|(_, slot)| !slot.choked && slot.interested)
            .map(|(&peer, _)| peer)
            .collect();
        for peer in requestable {
            self.fill_requests(peer).await;
        }
    }

    /// Tells the peer whether we are interested, when that changed.
    async fn update_interest(&mut self, peer: PeerIndex) {
        let Some(slot) = self.peers.get_mut(&peer) else {
            return;
        };
        let wants = self.table.wants_any(&slot.bitfield);
        if wants != slot.interested {
            slot.interested = wants;
            let _ = slot.commands.send(PeerCommand::SetInterested(wants)).await;
        }
    }

    /// Re-evaluates interest for every peer; needed after a piece
    /// completes since some peers may have nothing left we want.
    async fn refresh_interest(&mut self) {
        let peers: Vec<PeerIndex> = self.peers.keys().copied().collect();
        for peer in peers {
            self.update_interest(peer).await;
        }
    }

    fn forfeit_requests(&mut self, peer: PeerIndex, choked: bool) {
        let Self { peers, table, .. } = self;
        let Some(slot) = peers.get_mut(&peer) else {
            return;
        };
        if choked {
            slot.choked = true;
        }
        for ((piece, begin), _) in slot.outstanding.drain() {
            table.release_block(piece, begin);
        }
    }

    async fn demerit(&mut self, peer: PeerIndex) {
        let Some(slot) = self.peers.get_mut(&peer) else {
            return;
        };
        slot.demerits += 1;
        if slot.demerits >= DEMERIT_LIMIT {
            tracing::warn!(peer, "demerit limit reached, dropping peer");
            let _ = slot.commands.send(PeerCommand::Shutdown).await;
        }
    }

    /// Drops requests that have been outstanding past [`REQUEST_TIMEOUT`]
    /// and steers the affected pieces toward other peers. CANCEL messages
    /// go out best-effort; the blocks are already considered forfeit.
    async fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let mut cancels: Vec<(PeerIndex, BlockRequest)> = Vec::new();
        {
            let Self { peers, table, .. } = self;
            for (&peer, slot) in peers.iter_mut() {
                let expired: Vec<(u32, u32)> = slot
                    .outstanding
                    .iter()
                    .filter(|(_, pending)| {
                        now.duration_since(pending.issued_at) >= REQUEST_TIMEOUT
                    })
                    .map(|(&key, _)| key)
                    .collect();
                for (piece, begin) in expired {
                    if let Some(pending) = slot.outstanding.remove(&(piece, begin)) {
                        cancels.push((
                            peer,
                            BlockRequest {
                                piece,
                                begin,
                                length: pending.length,
                            },
                        ));
                    }
                    slot.assigned.remove(&piece);
                    table.release_block(piece, begin);
                    table.unassign(piece, peer);
                }
            }
        }
        if cancels.is_empty() {
            return;
        }
        for (peer, request) in cancels {
            tracing::debug!(
                peer,
                piece = request.piece,
                begin = request.begin,
                "block request timed out"
            );
            if let Some(slot) = self.peers.get(&peer) {
                let _ = slot
                    .commands
                    .send(PeerCommand::CancelRequest(request))
                    .await;
            }
        }
        self.fill_all().await;
    }

    async fn broadcast_have(&mut self, piece: u32) {
        for slot in self.peers.values() {
            let _ = slot.commands.send(PeerCommand::SendHave(piece)).await;
        }
    }

    async fn shutdown_peers(&mut self) {
        for slot in self.peers.values() {
            let _ = slot.commands.send(PeerCommand::Shutdown).await;
        }
    }

    fn emit_progress(&mut self) {
        let bytes_done = self.table.done_bytes();
        let delta = bytes_done.saturating_sub(self.last_bytes);
        self.last_bytes = bytes_done;
        let snapshot = ProgressSnapshot {
            pieces_done: self.table.done(),
            pieces_total: self.table.num_pieces(),
            bytes_done,
            bytes_total: self.table.total_bytes(),
            peers_connected: self.peers.len(),
            peers_total_seen: self.peers_total_seen,
            download_rate_bps: delta * 8 / PROGRESS_INTERVAL.as_secs().max(1),
            elapsed_s: self.started.elapsed().as_secs(),
        };
        let _ = self.progress.send(ProgressEvent::Snapshot(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info_hash::sha1_digest;
    use crate::torrent::{InfoDict, Metainfo};

    fn tiny_metainfo(content: &[u8], piece_length: u64) -> Metainfo {
        let piece_hashes: Vec<[u8; 20]> = content
            .chunks(piece_length as usize)
            .map(sha1_digest)
            .collect();
        let pieces = piece_hashes.iter().flatten().copied().collect();
        Metainfo {
            announce: None,
            announce_list: vec![],
            creation_date: None,
            comment: None,
            created_by: None,
            encoding: None,
            info: InfoDict {
                name: "t".to_string(),
                piece_length,
                pieces,
                private: false,
                length: Some(content.len() as u64),
                files: vec![],
            },
            info_hash: [0u8; 20],
            piece_hashes,
        }
    }

    struct Harness {
        events: mpsc::Sender<PeerEvent>,
        storage: mpsc::Receiver<StorageCommand>,
        _progress: broadcast::Receiver<ProgressEvent>,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<SchedulerExit>,
    }

    fn spawn_scheduler(metainfo: &Metainfo) -> Harness {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (storage_tx, storage_rx) = mpsc::channel(64);
        let (progress_tx, progress_rx) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            Config::default(),
            metainfo,
            events_rx,
            storage_tx,
            progress_tx,
            1,
            shutdown_rx,
        );
        Harness {
            events: events_tx,
            storage: storage_rx,
            _progress: progress_rx,
            shutdown: shutdown_tx,
            handle: tokio::spawn(scheduler.run()),
        }
    }

    fn full_bitfield(num_pieces: usize) -> Bitfield {
        let mut field = Bitfield::new(num_pieces);
        for piece in 0..num_pieces {
            field.set(piece);
        }
        field
    }

    #[tokio::test]
    async fn downloads_a_piece_end_to_end() {
        let content = b"engine test payload".to_vec();
        let metainfo = tiny_metainfo(&content, 32);
        let mut harness = spawn_scheduler(&metainfo);

        let (commands_tx, mut commands_rx) = mpsc::channel(64);
        harness
            .events
            .send(PeerEvent::Connected {
                peer: 0,
                commands: commands_tx,
            })
            .await
            .unwrap();
        harness
            .events
            .send(PeerEvent::Bitfield {
                peer: 0,
                bitfield: full_bitfield(1),
            })
            .await
            .unwrap();

        // the bitfield shows a needed piece: interest must be declared
        assert!(matches!(
            commands_rx.recv().await.unwrap(),
            PeerCommand::SetInterested(true)
        ));

        harness
            .events
            .send(PeerEvent::Unchoked { peer: 0 })
            .await
            .unwrap();
        let request = match commands_rx.recv().await.unwrap() {
            PeerCommand::IssueRequests(mut requests) => {
                assert_eq!(requests.len(), 1);
                requests.pop().unwrap()
            }
            other => panic!("expected IssueRequests, got {other:?}"),
        };
        assert_eq!(request.piece, 0);
        assert_eq!(request.begin, 0);
        assert_eq!(request.length as usize, content.len());

        harness
            .events
            .send(PeerEvent::BlockReceived {
                peer: 0,
                piece: 0,
                begin: 0,
                data: content.clone(),
            })
            .await
            .unwrap();

        match harness.storage.recv().await.unwrap() {
            StorageCommand::WritePiece { index, data } => {
                assert_eq!(index, 0);
                assert_eq!(data, content);
            }
        }
        assert_eq!(harness.handle.await.unwrap(), SchedulerExit::Complete);
    }

    #[tokio::test]
    async fn choke_forfeits_requests_for_reissue_elsewhere() {
        let content = vec![0xC3u8; 48];
        let metainfo = tiny_metainfo(&content, 48);
        let mut harness = spawn_scheduler(&metainfo);

        // two peers, both with the piece
        let (commands_a_tx, mut commands_a) = mpsc::channel(64);
        let (commands_b_tx, mut commands_b) = mpsc::channel(64);
        for (peer, commands) in [(0, commands_a_tx), (1, commands_b_tx)] {
            harness
                .events
                .send(PeerEvent::Connected { peer, commands })
                .await
                .unwrap();
            harness
                .events
                .send(PeerEvent::Bitfield {
                    peer,
                    bitfield: full_bitfield(1),
                })
                .await
                .unwrap();
        }
        assert!(matches!(
            commands_a.recv().await.unwrap(),
            PeerCommand::SetInterested(true)
        ));
        assert!(matches!(
            commands_b.recv().await.unwrap(),
            PeerCommand::SetInterested(true)
        ));

        // peer 0 unchokes and gets the request
        harness
            .events
            .send(PeerEvent::Unchoked { peer: 0 })
            .await
            .unwrap();
        assert!(matches!(
            commands_a.recv().await.unwrap(),
            PeerCommand::IssueRequests(_)
        ));

        // peer 0 chokes before answering; peer 1 is unchoked and must
        // inherit the forfeited block
        harness
            .events
            .send(PeerEvent::Unchoked { peer: 1 })
            .await
            .unwrap();
        harness
            .events
            .send(PeerEvent::Choked { peer: 0 })
            .await
            .unwrap();
        match commands_b.recv().await.unwrap() {
            PeerCommand::IssueRequests(requests) => {
                assert_eq!(requests[0].piece, 0);
                assert_eq!(requests[0].begin, 0);
            }
            other => panic!("expected IssueRequests, got {other:?}"),
        }

        harness.shutdown.send(true).unwrap();
        assert_eq!(harness.handle.await.unwrap(), SchedulerExit::Interrupted);
    }

    #[tokio::test]
    async fn swarm_exhaustion_ends_the_run() {
        let metainfo = tiny_metainfo(&[1u8; 8], 8);
        let harness = spawn_scheduler(&metainfo);
        drop(harness.events);
        assert_eq!(
            harness.handle.await.unwrap(),
            SchedulerExit::PeersExhausted
        );
    }

    #[tokio::test]
    async fn empty_torrent_completes_immediately() {
        let metainfo = tiny_metainfo(&[], 8);
        let harness = spawn_scheduler(&metainfo);
        assert_eq!(harness.handle.await.unwrap(), SchedulerExit::Complete);
    }
}
