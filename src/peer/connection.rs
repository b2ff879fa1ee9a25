//! Per-peer connection task.
//!
//! Each connected peer is driven by one reader task and one writer task
//! sharing a TCP stream. The reader translates wire messages into
//! [`PeerEvent`]s for the scheduler; the writer executes the scheduler's
//! [`PeerCommand`]s and keeps the connection alive. Neither half touches
//! scheduler state directly: the scheduler owns all piece bookkeeping and
//! the connection owns nothing but the socket and its four protocol
//! flags.
use super::bitfield::Bitfield;
use super::handshake;
use super::message::{Message, MAX_FRAME_LEN};
use super::{BlockRequest, PeerError, PeerIndex};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tokio::io::AsyncWriteExt;

/// Connections with no traffic for this long are torn down.
pub const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Idle keep-alive cadence; must stay under the peer's own read timeout.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

const COMMAND_BUFFER: usize = 64;

/// What a peer connection reports to the scheduler.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake succeeded; `commands` is the channel for driving this
    /// connection from the scheduler side.
    Connected {
        peer: PeerIndex,
        commands: mpsc::Sender<PeerCommand>,
    },
    Bitfield {
        peer: PeerIndex,
        bitfield: Bitfield,
    },
    Have {
        peer: PeerIndex,
        piece: u32,
    },
    Choked {
        peer: PeerIndex,
    },
    Unchoked {
        peer: PeerIndex,
    },
    BlockReceived {
        peer: PeerIndex,
        piece: u32,
        begin: u32,
        data: Vec<u8>,
    },
    /// Terminal: the connection is gone, whatever the cause.
    Disconnected {
        peer: PeerIndex,
    },
}

/// What the scheduler asks a peer connection to do.
#[derive(Debug)]
pub enum PeerCommand {
    IssueRequests(Vec<BlockRequest>),
    CancelRequest(BlockRequest),
    SetInterested(bool),
    SendHave(u32),
    Shutdown,
}

/// Parameters of one outbound peer connection.
#[derive(Debug)]
pub struct Connection {
    pub index: PeerIndex,
    pub addr: SocketAddr,
    pub info_hash: [u8; 20],
    pub our_peer_id: [u8; 20],
    pub num_pieces: usize,
}

impl Connection {
    /// Runs the connection to completion: connect, handshake, then pump
    /// messages until error, timeout or shutdown. Always emits
    /// `Disconnected` last (and as the only event when the handshake
    /// never completes).
    #[tracing::instrument(level = "debug", skip(self, events), fields(peer = self.index, addr = %self.addr))]
    pub async fn run(self, events: mpsc::Sender<PeerEvent>) {
        match handshake::connect(self.addr, self.info_hash, self.our_peer_id).await {
            Ok((stream, theirs)) => {
                tracing::debug!(
                    peer_id = %String::from_utf8_lossy(&theirs.peer_id),
                    extensions = theirs.supports_extensions(),
                    "peer connected"
                );
                let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
                if events
                    .send(PeerEvent::Connected {
                        peer: self.index,
                        commands: commands_tx,
                    })
                    .await
                    .is_err()
                {
                    return;
                }

                let (read_half, write_half) = stream.into_split();
                let shutdown = Arc::new(Notify::new());
                let writer = tokio::spawn(write_loop(
                    write_half,
                    commands_rx,
                    Arc::clone(&shutdown),
                ));
                self.read_loop(read_half, &events, &shutdown).await;
                writer.abort();
            }
            Err(e) => {
                tracing::debug!(error = %e, "peer connection failed");
            }
        }
        let _ = events
            .send(PeerEvent::Disconnected { peer: self.index })
            .await;
    }

    async fn read_loop(
        &self,
        mut read_half: OwnedReadHalf,
        events: &mpsc::Sender<PeerEvent>,
        shutdown: &Notify,
    ) {
        // a huge torrent's bitfield may outgrow the default frame cap
        let max_frame = MAX_FRAME_LEN.max(1 + self.num_pieces.div_ceil(8));
        let mut may_send_bitfield = true;

        loop {
            let message = tokio::select! {
                read = timeout(READ_TIMEOUT, Message::read_from(&mut read_half, max_frame)) => {
                    match read {
                        Err(_) => {
                            tracing::debug!("peer idle past the read timeout");
                            return;
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(error = %e, "peer read failed");
                            return;
                        }
                        Ok(Ok(message)) => message,
                    }
                }
                _ = shutdown.notified() => return,
            };

            let event = match message {
                Message::KeepAlive => continue,
                Message::Bitfield(bytes) => {
                    // BITFIELD is only legal as the first real message
                    if !may_send_bitfield {
                        tracing::debug!("late BITFIELD message");
                        return;
                    }
                    may_send_bitfield = false;
                    match Bitfield::from_bytes(bytes, self.num_pieces) {
                        Ok(bitfield) => PeerEvent::Bitfield {
                            peer: self.index,
                            bitfield,
                        },
                        Err(e) => {
                            tracing::debug!(error = %e, "rejecting bitfield");
                            return;
                        }
                    }
                }
                Message::Have(piece) => {
                    may_send_bitfield = false;
                    if piece as usize >= self.num_pieces {
                        tracing::debug!(piece, "HAVE for a piece index out of range");
                        return;
                    }
                    PeerEvent::Have {
                        peer: self.index,
                        piece,
                    }
                }
                Message::Choke => {
                    may_send_bitfield = false;
                    PeerEvent::Choked { peer: self.index }
                }
                Message::Unchoke => {
                    may_send_bitfield = false;
                    PeerEvent::Unchoked { peer: self.index }
                }
                Message::Piece {
                    piece,
                    begin,
                    block,
                } => {
                    may_send_bitfield = false;
                    PeerEvent::BlockReceived {
                        peer: self.index,
                        piece,
                        begin,
                        data: block,
                    }
                }
                Message::Interested | Message::NotInterested => {
                    // we never unchoke anyone, so peer interest is moot
                    may_send_bitfield = false;
                    continue;
                }
                Message::Request { piece, .. } => {
                    // a leecher serves nothing; requests before we ever
                    // unchoke are simply ignored
                    may_send_bitfield = false;
                    tracing::trace!(piece, "ignoring REQUEST from peer");
                    continue;
                }
                Message::Cancel { .. } | Message::Extended { .. } => {
                    may_send_bitfield = false;
                    continue;
                }
                Message::Unknown(id) => {
                    may_send_bitfield = false;
                    tracing::trace!(id, "ignoring unknown message id");
                    continue;
                }
            };

            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

/// Consumes scheduler commands and the keep-alive timer. Exits when the
/// command channel closes, on Shutdown, or on any write error; in every
/// case the reader is woken via `shutdown` so the whole connection dies
/// together.
async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut commands: mpsc::Receiver<PeerCommand>,
    shutdown: Arc<Notify>,
) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result: Result<(), PeerError> = async {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(PeerCommand::Shutdown) => {
                        let _ = write_half.shutdown().await;
                        return Ok(());
                    }
                    Some(PeerCommand::IssueRequests(requests)) => {
                        for request in requests {
                            Message::Request {
                                piece: request.piece,
                                begin: request.begin,
                                length: request.length,
                            }
                            .write_to(&mut write_half)
                            .await?;
                        }
                    }
                    Some(PeerCommand::CancelRequest(request)) => {
                        Message::Cancel {
                            piece: request.piece,
                            begin: request.begin,
                            length: request.length,
                        }
                        .write_to(&mut write_half)
                        .await?;
                    }
                    Some(PeerCommand::SetInterested(interested)) => {
                        let message = if interested {
                            Message::Interested
                        } else {
                            Message::NotInterested
                        };
                        message.write_to(&mut write_half).await?;
                    }
                    Some(PeerCommand::SendHave(piece)) => {
                        Message::Have(piece).write_to(&mut write_half).await?;
                    }
                },
                _ = keepalive.tick() => {
                    Message::KeepAlive.write_to(&mut write_half).await?;
                }
            }
        }
    }
    .await;

    if let Err(e) = result {
        tracing::debug!(error = %e, "peer write failed");
    }
    shutdown.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Handshake;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    /// Drives a scripted remote peer: completes the handshake, sends a
    /// bitfield, unchokes, and serves one block on request.
    async fn scripted_seed(listener: TcpListener, info_hash: [u8; 20]) {
        let (mut stream, _) = listener.accept().await.unwrap();
        Handshake::read(&mut stream).await.unwrap();
        stream
            .write_all(&Handshake::new(info_hash, [9u8; 20]).serialize())
            .await
            .unwrap();

        // 4 pieces -> one byte, all set
        Message::Bitfield(vec![0xF0]).write_to(&mut stream).await.unwrap();
        Message::Unchoke.write_to(&mut stream).await.unwrap();

        loop {
            match Message::read_from(&mut stream, MAX_FRAME_LEN).await {
                Ok(Message::Request { piece, begin, length }) => {
                    Message::Piece {
                        piece,
                        begin,
                        block: vec![0xAB; length as usize],
                    }
                    .write_to(&mut stream)
                    .await
                    .unwrap();
                }
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    }

    #[tokio::test]
    async fn connection_reports_events_and_executes_commands() {
        let info_hash = [5u8; 20];
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(scripted_seed(listener, info_hash));

        let (events_tx, mut events_rx) = mpsc::channel(64);
        let connection = Connection {
            index: 0,
            addr,
            info_hash,
            our_peer_id: [1u8; 20],
            num_pieces: 4,
        };
        tokio::spawn(connection.run(events_tx));

        let commands = match events_rx.recv().await.unwrap() {
            PeerEvent::Connected { peer: 0, commands } => commands,
            other => panic!("expected Connected, got {other:?}"),
        };
        match events_rx.recv().await.unwrap() {
            PeerEvent::Bitfield { bitfield, .. } => {
                assert_eq!(bitfield.pieces().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
            }
            other => panic!("expected Bitfield, got {other:?}"),
        }
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            PeerEvent::Unchoked { peer: 0 }
        ));

        commands
            .send(PeerCommand::SetInterested(true))
            .await
            .unwrap();
        commands
            .send(PeerCommand::IssueRequests(vec![BlockRequest {
                piece: 2,
                begin: 0,
                length: 64,
            }]))
            .await
            .unwrap();

        match events_rx.recv().await.unwrap() {
            PeerEvent::BlockReceived {
                piece, begin, data, ..
            } => {
                assert_eq!((piece, begin), (2, 0));
                assert_eq!(data, vec![0xAB; 64]);
            }
            other => panic!("expected BlockReceived, got {other:?}"),
        }

        commands.send(PeerCommand::Shutdown).await.unwrap();
        loop {
            match events_rx.recv().await {
                Some(PeerEvent::Disconnected { peer: 0 }) => break,
                Some(_) => continue,
                None => panic!("event stream closed without Disconnected"),
            }
        }
    }

    #[tokio::test]
    async fn failed_dial_still_reports_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events_tx, mut events_rx) = mpsc::channel(8);
        let connection = Connection {
            index: 3,
            addr,
            info_hash: [0u8; 20],
            our_peer_id: [1u8; 20],
            num_pieces: 1,
        };
        connection.run(events_tx).await;
        assert!(matches!(
            events_rx.recv().await,
            Some(PeerEvent::Disconnected { peer: 3 })
        ));
    }
}
