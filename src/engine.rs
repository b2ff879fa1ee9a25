//! Engine orchestrator.
//!
//! Wires the whole session together: resolve the source (running the
//! metadata fetch first for magnets), announce to trackers, stand up the
//! storage writer and the scheduler, spawn peer connections up to the
//! cap, and run until the last piece verifies or something fatal
//! happens. Progress flows out on a broadcast channel whose slow readers
//! lose old snapshots instead of stalling the engine.
use crate::config::{Config, ConfigError};
use crate::metadata::{self, MetadataError};
use crate::peer::Connection;
use crate::progress::ProgressEvent;
use crate::scheduler::{Scheduler, SchedulerExit};
use crate::storage::{StorageError, StorageWriter};
use crate::torrent::{FileLayout, MagnetError, MagnetLink, Metainfo, TorrentError};
use crate::tracker::{self, AnnounceRequest, Event};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;

const EVENT_BUFFER: usize = 1024;
const STORAGE_BUFFER: usize = 64;
const PROGRESS_BUFFER: usize = 256;

/// Where a download comes from.
#[derive(Debug, Clone)]
pub enum TorrentSource {
    File(PathBuf),
    MagnetUri(MagnetLink),
}

impl TorrentSource {
    /// A `magnet:` string parses as a magnet link; anything else is
    /// treated as a path to a metainfo file.
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        if input.starts_with("magnet:") {
            Ok(TorrentSource::MagnetUri(MagnetLink::parse(input)?))
        } else {
            Ok(TorrentSource::File(PathBuf::from(input)))
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("could not read torrent source: {0}")]
    Input(std::io::Error),

    #[error("invalid torrent file: {0}")]
    Torrent(#[from] TorrentError),

    #[error("invalid magnet link: {0}")]
    Magnet(#[from] MagnetError),

    #[error("metadata fetch failed: {0}")]
    Metadata(#[from] MetadataError),

    #[error("every tracker announce failed: {0}")]
    Announce(String),

    #[error("trackers returned zero peers")]
    NoPeers,

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("all peers disconnected before completion")]
    SwarmExhausted,

    #[error("interrupted")]
    Interrupted,

    #[error("internal task failure: {0}")]
    Internal(String),
}

impl EngineError {
    /// Process exit code for the front-end: 2 for unusable input, 130
    /// for a user interrupt, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_)
            | EngineError::Input(_)
            | EngineError::Torrent(_)
            | EngineError::Magnet(_) => 2,
            EngineError::Interrupted => 130,
            _ => 1,
        }
    }
}

pub struct Engine {
    cfg: Config,
    progress: broadcast::Sender<ProgressEvent>,
}

impl Engine {
    pub fn new(cfg: Config) -> Result<Self, EngineError> {
        cfg.validate()?;
        let (progress, _) = broadcast::channel(PROGRESS_BUFFER);
        Ok(Self { cfg, progress })
    }

    /// Subscribes a UI collaborator to the progress event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Runs one download session to completion and emits the terminal
    /// progress event.
    pub async fn run(&self, source: TorrentSource, output_dir: &Path) -> Result<(), EngineError> {
        let result = self.run_session(source, output_dir).await;
        match &result {
            Ok(()) => {
                let _ = self.progress.send(ProgressEvent::Completed);
            }
            Err(e) => {
                let _ = self.progress.send(ProgressEvent::Failed {
                    cause: e.to_string(),
                });
            }
        }
        result
    }

    async fn run_session(
        &self,
        source: TorrentSource,
        output_dir: &Path,
    ) -> Result<(), EngineError> {
        let peer_id = tracker::generate_peer_id();

        let (metainfo, peers) = match source {
            TorrentSource::File(path) => {
                let data = tokio::fs::read(&path).await.map_err(EngineError::Input)?;
                let metainfo = Metainfo::from_bytes(&data)?;
                let peers = self
                    .announce(
                        &metainfo.trackers(),
                        metainfo.info_hash,
                        peer_id,
                        metainfo.total_length(),
                    )
                    .await?;
                (metainfo, peers)
            }
            TorrentSource::MagnetUri(magnet) => {
                let peers = self
                    .announce(
                        &magnet.trackers,
                        magnet.info_hash,
                        peer_id,
                        magnet.expected_length.unwrap_or(0),
                    )
                    .await?;
                let info_bytes = metadata::fetch(magnet.info_hash, peer_id, &peers).await?;
                let metainfo = Metainfo::from_info_bytes(&info_bytes, magnet.trackers.clone())?;
                (metainfo, peers)
            }
        };
        tracing::info!(
            name = %metainfo.info.name,
            pieces = metainfo.num_pieces(),
            bytes = metainfo.total_length(),
            peers = peers.len(),
            "session ready"
        );

        let layout = FileLayout::from_info(&metainfo.info)?;
        let piece_length = metainfo.info.piece_length;
        let (storage_tx, storage_rx) = mpsc::channel(STORAGE_BUFFER);
        let output = output_dir.to_path_buf();
        let writer =
            tokio::task::spawn_blocking(move || StorageWriter::create(&output, layout, piece_length))
                .await
                .map_err(join_failure)??;
        let mut storage_task = tokio::task::spawn_blocking(move || writer.run(storage_rx));

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            self.cfg.clone(),
            &metainfo,
            events_rx,
            storage_tx,
            self.progress.clone(),
            peers.len(),
            shutdown_rx,
        );
        let mut scheduler_task = tokio::spawn(scheduler.run());

        for (index, addr) in peers.iter().take(self.cfg.max_peers).enumerate() {
            let connection = Connection {
                index,
                addr: *addr,
                info_hash: metainfo.info_hash,
                our_peer_id: peer_id,
                num_pieces: metainfo.num_pieces(),
            };
            tokio::spawn(connection.run(events_tx.clone()));
        }
        // the peer tasks hold the only senders now; when the last one
        // exits the scheduler sees the swarm dry up
        drop(events_tx);

        tokio::select! {
            exit = &mut scheduler_task => {
                match exit.map_err(join_failure)? {
                    SchedulerExit::Complete => {
                        // scheduler dropped its storage sender: the
                        // writer drains the backlog, syncs and exits
                        storage_task.await.map_err(join_failure)??;
                        Ok(())
                    }
                    SchedulerExit::StorageClosed => {
                        match storage_task.await.map_err(join_failure)? {
                            Err(e) => Err(EngineError::Storage(e)),
                            Ok(()) => Err(EngineError::Internal(
                                "storage writer ended mid-session".to_string(),
                            )),
                        }
                    }
                    SchedulerExit::PeersExhausted => Err(EngineError::SwarmExhausted),
                    SchedulerExit::Interrupted => Err(EngineError::Interrupted),
                }
            }
            result = &mut storage_task => {
                let _ = shutdown_tx.send(true);
                let _ = (&mut scheduler_task).await;
                match result.map_err(join_failure)? {
                    Err(e) => Err(EngineError::Storage(e)),
                    Ok(()) => Err(EngineError::Internal(
                        "storage writer ended mid-session".to_string(),
                    )),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
                let _ = (&mut scheduler_task).await;
                let _ = (&mut storage_task).await;
                Err(EngineError::Interrupted)
            }
        }
    }

    /// Announces to every tracker concurrently and adopts the peer set of
    /// the first one that answers with peers.
    async fn announce(
        &self,
        trackers: &[String],
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        left: u64,
    ) -> Result<Vec<SocketAddr>, EngineError> {
        if trackers.is_empty() {
            return Err(EngineError::Announce(
                "the source names no trackers".to_string(),
            ));
        }

        let mut tasks = JoinSet::new();
        for url in trackers {
            let url = url.clone();
            let request = AnnounceRequest {
                info_hash,
                peer_id,
                port: self.cfg.listen_port,
                uploaded: 0,
                downloaded: 0,
                left,
                event: Some(Event::Started),
            };
            tasks.spawn(async move {
                let result = tracker::announce(&url, &request).await;
                (url, result)
            });
        }

        let mut empty_success = false;
        let mut last_error = String::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((url, result)) = joined else {
                continue;
            };
            match result {
                Ok(response) if !response.peers.is_empty() => {
                    tracing::debug!(
                        %url,
                        peers = response.peers.len(),
                        interval = response.interval,
                        "announce succeeded"
                    );
                    tasks.abort_all();
                    let mut peers: Vec<SocketAddr> = Vec::new();
                    for peer in response.peers {
                        let addr = peer.addr();
                        if !peers.contains(&addr) {
                            peers.push(addr);
                        }
                    }
                    return Ok(peers);
                }
                Ok(_) => {
                    tracing::debug!(%url, "tracker answered with zero peers");
                    empty_success = true;
                }
                Err(e) => {
                    tracing::warn!(%url, error = %e, "announce failed");
                    last_error = e.to_string();
                }
            }
        }

        if empty_success {
            Err(EngineError::NoPeers)
        } else {
            Err(EngineError::Announce(last_error))
        }
    }
}

fn join_failure(e: tokio::task::JoinError) -> EngineError {
    EngineError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encode_to_vec, Value};
    use crate::peer::message::{Message, MAX_FRAME_LEN};
    use crate::peer::Handshake;
    use crate::torrent::info_hash::sha1_digest;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A seed that serves `content` for any number of connections.
    async fn seed_peer(
        listener: TcpListener,
        info_hash: [u8; 20],
        content: Vec<u8>,
        piece_length: usize,
    ) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let content = content.clone();
            tokio::spawn(async move {
                if Handshake::read(&mut stream).await.is_err() {
                    return;
                }
                stream
                    .write_all(&Handshake::new(info_hash, [9u8; 20]).serialize())
                    .await
                    .unwrap();

                let num_pieces = content.len().div_ceil(piece_length);
                let mut bits = vec![0u8; num_pieces.div_ceil(8)];
                for piece in 0..num_pieces {
                    bits[piece / 8] |= 0x80 >> (piece % 8);
                }
                Message::Bitfield(bits).write_to(&mut stream).await.unwrap();
                Message::Unchoke.write_to(&mut stream).await.unwrap();

                loop {
                    match Message::read_from(&mut stream, MAX_FRAME_LEN).await {
                        Ok(Message::Request {
                            piece,
                            begin,
                            length,
                        }) => {
                            let start = piece as usize * piece_length + begin as usize;
                            Message::Piece {
                                piece,
                                begin,
                                block: content[start..start + length as usize].to_vec(),
                            }
                            .write_to(&mut stream)
                            .await
                            .unwrap();
                        }
                        Ok(_) => continue,
                        Err(_) => return,
                    }
                }
            });
        }
    }

    /// Minimal HTTP tracker answering every GET with one compact peer.
    async fn http_tracker(listener: TcpListener, peer: SocketAddr) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut request = [0u8; 2048];
            let _ = stream.read(&mut request).await;

            let SocketAddr::V4(v4) = peer else { return };
            let mut compact = v4.ip().octets().to_vec();
            compact.extend_from_slice(&v4.port().to_be_bytes());

            let mut dict = BTreeMap::new();
            dict.insert(b"interval".to_vec(), Value::Integer(1800));
            dict.insert(b"peers".to_vec(), Value::Bytes(compact));
            let body = encode_to_vec(&Value::Dict(dict)).unwrap();

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.write_all(&body).await;
        }
    }

    fn build_torrent(content: &[u8], piece_length: usize, announce: &str) -> Vec<u8> {
        let pieces: Vec<u8> = content
            .chunks(piece_length)
            .flat_map(|chunk| sha1_digest(chunk))
            .collect();
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Value::Integer(content.len() as i64));
        info.insert(b"name".to_vec(), Value::Bytes(b"payload.bin".to_vec()));
        info.insert(
            b"piece length".to_vec(),
            Value::Integer(piece_length as i64),
        );
        info.insert(b"pieces".to_vec(), Value::Bytes(pieces));
        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            Value::Bytes(announce.as_bytes().to_vec()),
        );
        root.insert(b"info".to_vec(), Value::Dict(info));
        encode_to_vec(&Value::Dict(root)).unwrap()
    }

    #[tokio::test]
    async fn downloads_a_torrent_from_a_live_swarm() {
        let piece_length = 16 * 1024;
        let content: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();

        let seed_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seed_addr = seed_listener.local_addr().unwrap();

        let tracker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let announce = format!(
            "http://{}/announce",
            tracker_listener.local_addr().unwrap()
        );
        tokio::spawn(http_tracker(tracker_listener, seed_addr));

        let torrent = build_torrent(&content, piece_length, &announce);
        let info_hash = crate::torrent::info_hash::from_torrent_bytes(&torrent).unwrap();
        tokio::spawn(seed_peer(
            seed_listener,
            info_hash,
            content.clone(),
            piece_length,
        ));

        let dir = tempfile::tempdir().unwrap();
        let torrent_path = dir.path().join("payload.torrent");
        std::fs::write(&torrent_path, &torrent).unwrap();

        let engine = Engine::new(Config::default()).unwrap();
        let mut progress = engine.subscribe();
        let source = TorrentSource::parse(torrent_path.to_str().unwrap()).unwrap();
        engine.run(source, dir.path()).await.unwrap();

        let downloaded = std::fs::read(dir.path().join("payload.bin")).unwrap();
        assert_eq!(downloaded, content);

        // terminal event reaches the UI collaborator
        let mut saw_completed = false;
        while let Ok(event) = progress.try_recv() {
            if matches!(event, ProgressEvent::Completed) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn missing_torrent_file_is_bad_input() {
        let engine = Engine::new(Config::default()).unwrap();
        let source = TorrentSource::parse("/nonexistent/zzz.torrent").unwrap();
        let err = engine
            .run(source, Path::new("/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn magnet_without_trackers_fails_cleanly() {
        let engine = Engine::new(Config::default()).unwrap();
        let source = TorrentSource::parse(&format!(
            "magnet:?xt=urn:btih:{}",
            "11".repeat(20)
        ))
        .unwrap();
        let err = engine.run(source, Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, EngineError::Announce(_)));
        assert_eq!(err.exit_code(), 1);
    }
}
