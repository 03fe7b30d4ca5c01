use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use bittorrent_wire::{Block, BlockRequest, Decode, Encode, FrameDecoder, Handshake, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// System-wide events fanned out to every live session
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    /// A piece was verified and written to disk; sessions announce it with
    /// a `have` message
    PieceCommitted(u32),
    /// The download is over (finished or aborted); sessions close cleanly
    Shutdown,
}

/// Scheduler-to-session commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    Request(BlockRequest),
    Cancel(BlockRequest),
    SetInterested(bool),
    Shutdown,
}

/// Why a session ended. Termination is a value on the event channel, never
/// an exception path: the scheduler reacts by reclaiming in-flight blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The download finished and the session said goodbye
    Finished,
    /// The scheduler asked this session to close
    Requested,
    /// Nothing was received for the idle window
    IdleTimeout,
    /// The remote peer violated the protocol
    Protocol(&'static str),
    /// Connect failure, reset, or any other transport-level loss
    ConnectionLost,
}

/// Session-to-scheduler events
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake succeeded. Carries the command channel the scheduler uses
    /// to drive this session from now on.
    Connected {
        peer_id: [u8; 20],
        commands: mpsc::Sender<PeerCommand>,
    },
    Bitfield(BitVec<u8, Msb0>),
    Have(u32),
    Choked,
    Unchoked,
    Block(Block),
    Closed(CloseReason),
}

/// One connection to one remote peer.
///
/// The session owns its socket and the local mirror of the remote's state
/// exclusively. All coordination happens over channels: commands in, events
/// out, swarm broadcasts in.
#[derive(Debug)]
pub struct PeerSession {
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    piece_count: usize,
    /// Sent right after the handshake when any piece is already committed
    initial_bitfield: Option<BitVec<u8, Msb0>>,
    events_tx: mpsc::UnboundedSender<(SocketAddr, PeerEvent)>,
    commands_tx: Option<mpsc::Sender<PeerCommand>>,
    commands_rx: mpsc::Receiver<PeerCommand>,
    broadcast_rx: broadcast::Receiver<SwarmEvent>,
    /// Pieces the remote peer claims to have
    remote_bitfield: BitVec<u8, Msb0>,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

impl PeerSession {
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
    const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
    const COMMAND_QUEUE_DEPTH: usize = 64;
    const READ_CHUNK_LEN: usize = 16_384;

    pub fn new(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        piece_count: usize,
        initial_bitfield: Option<BitVec<u8, Msb0>>,
        events_tx: mpsc::UnboundedSender<(SocketAddr, PeerEvent)>,
        broadcast_rx: broadcast::Receiver<SwarmEvent>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(Self::COMMAND_QUEUE_DEPTH);

        PeerSession {
            addr,
            info_hash,
            our_peer_id,
            piece_count,
            initial_bitfield,
            events_tx,
            commands_tx: Some(commands_tx),
            commands_rx,
            broadcast_rx,
            remote_bitfield: BitVec::repeat(false, piece_count),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }

    /// Runs the session to completion. The final `Closed` event always
    /// reaches the scheduler, whatever the exit path.
    #[tracing::instrument(skip(self), fields(peer = %self.addr))]
    pub async fn run(mut self) -> anyhow::Result<()> {
        let reason = match self.connect_and_serve().await {
            Ok(reason) => reason,
            Err(e) => {
                tracing::debug!(error = %e, "peer session ended with an error");
                CloseReason::ConnectionLost
            }
        };

        tracing::debug!(?reason, "peer session closed");
        let _ = self.events_tx.send((self.addr, PeerEvent::Closed(reason)));

        Ok(())
    }

    async fn connect_and_serve(&mut self) -> anyhow::Result<CloseReason> {
        let stream = tokio::time::timeout(Self::CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .context("peer connect timed out")?
            .context("error while establishing connection")?;

        self.serve(stream).await
    }

    async fn serve(&mut self, mut stream: TcpStream) -> anyhow::Result<CloseReason> {
        Handshake::new(self.info_hash, self.our_peer_id)
            .encode(&mut stream)
            .await?;
        stream.flush().await?;

        let mut handshake_buf = [0u8; Handshake::LENGTH];
        tokio::time::timeout(Self::CONNECT_TIMEOUT, stream.read_exact(&mut handshake_buf))
            .await
            .context("peer handshake timed out")?
            .context("error while reading the handshake")?;

        let handshake = match Handshake::decode(&handshake_buf) {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::debug!(error = %e, "malformed handshake");
                return Ok(CloseReason::Protocol("malformed handshake"));
            }
        };
        if handshake.info_hash != self.info_hash {
            return Ok(CloseReason::Protocol("handshake info hash mismatch"));
        }

        let commands = self
            .commands_tx
            .take()
            .context("bug: a session was started twice?")?;
        self.send_event(PeerEvent::Connected {
            peer_id: handshake.peer_id,
            commands,
        })?;

        let mut out = Vec::new();
        if let Some(bitfield) = self.initial_bitfield.take() {
            if bitfield.any() {
                Message::Bitfield(bitfield).encode(&mut out).await?;
            }
        }

        let mut decoder = FrameDecoder::new(FrameDecoder::DEFAULT_MAX_FRAME_LEN);
        let mut chunk = vec![0u8; Self::READ_CHUNK_LEN];
        let mut last_sent = Instant::now();
        let mut last_received = Instant::now();

        loop {
            if !out.is_empty() {
                stream.write_all(&out).await?;
                stream.flush().await?;
                out.clear();
                last_sent = Instant::now();
            }

            tokio::select! {
                read = stream.read(&mut chunk) => {
                    let received = read.context("error while reading from the peer socket")?;
                    if received == 0 {
                        return Ok(CloseReason::ConnectionLost);
                    }
                    last_received = Instant::now();

                    decoder.push(&chunk[..received]);
                    loop {
                        match decoder.next_message() {
                            Ok(Some(message)) => {
                                if let Some(reason) = self.handle_message(message)? {
                                    return Ok(reason);
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::debug!(error = %e, "dropping the peer after a codec error");
                                return Ok(CloseReason::Protocol("undecodable message"));
                            }
                        }
                    }
                }
                command = self.commands_rx.recv() => {
                    let Some(command) = command else {
                        return Ok(CloseReason::Requested);
                    };
                    if let Some(reason) = self.handle_command(command, &mut out).await? {
                        stream.write_all(&out).await?;
                        stream.flush().await?;
                        return Ok(reason);
                    }
                }
                event = self.broadcast_rx.recv() => {
                    match event {
                        Ok(SwarmEvent::PieceCommitted(index)) => {
                            Message::Have(index).encode(&mut out).await?;
                        }
                        Ok(SwarmEvent::Shutdown) => {
                            if self.am_interested {
                                Message::NotInterested.encode(&mut out).await?;
                            }
                            stream.write_all(&out).await?;
                            stream.flush().await?;
                            return Ok(CloseReason::Finished);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "missed swarm events");
                        }
                        Err(RecvError::Closed) => return Ok(CloseReason::Requested),
                    }
                }
                _ = tokio::time::sleep_until(last_sent + Self::KEEPALIVE_INTERVAL) => {
                    Message::KeepAlive.encode(&mut out).await?;
                }
                _ = tokio::time::sleep_until(last_received + Self::IDLE_TIMEOUT) => {
                    return Ok(CloseReason::IdleTimeout);
                }
            }
        }
    }

    fn handle_message(&mut self, message: Message) -> anyhow::Result<Option<CloseReason>> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                self.send_event(PeerEvent::Choked)?;
            }
            Message::Unchoke => {
                self.peer_choking = false;
                self.send_event(PeerEvent::Unchoked)?;
            }
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have(index) => {
                if index as usize >= self.piece_count {
                    return Ok(Some(CloseReason::Protocol("have index out of range")));
                }
                // a repeated `have` must not be forwarded twice, or the
                // scheduler would double-count the piece's availability
                if !self.remote_bitfield.replace(index as usize, true) {
                    self.send_event(PeerEvent::Have(index))?;
                }
            }
            Message::Bitfield(bitfield) => {
                let expected_bytes = self.piece_count.div_ceil(8);
                if bitfield.as_raw_slice().len() != expected_bytes {
                    return Ok(Some(CloseReason::Protocol("bitfield length mismatch")));
                }
                if bitfield[self.piece_count..].any() {
                    return Ok(Some(CloseReason::Protocol("bitfield has non-zero spare bits")));
                }

                let mut bitfield = bitfield;
                bitfield.truncate(self.piece_count);
                self.remote_bitfield = bitfield.clone();
                self.send_event(PeerEvent::Bitfield(bitfield))?;
            }
            Message::Request { index, begin, length } => {
                // Requests are only honoured from an unchoked interested
                // peer, and this client never unchokes anyone
                if self.am_choking || !self.peer_interested {
                    tracing::trace!(index, begin, length, "ignoring a request while choking");
                }
            }
            Message::Piece { index, begin, block } => {
                self.send_event(PeerEvent::Block(Block { index, begin, block }))?;
            }
            Message::Cancel { index, begin, length } => {
                tracing::trace!(index, begin, length, "ignoring a cancel while choking");
            }
        };

        Ok(None)
    }

    async fn handle_command(
        &mut self,
        command: PeerCommand,
        out: &mut Vec<u8>,
    ) -> anyhow::Result<Option<CloseReason>> {
        match command {
            PeerCommand::Request(request) => {
                Message::Request {
                    index: request.index,
                    begin: request.begin,
                    length: request.length,
                }
                .encode(out)
                .await?;
            }
            PeerCommand::Cancel(request) => {
                Message::Cancel {
                    index: request.index,
                    begin: request.begin,
                    length: request.length,
                }
                .encode(out)
                .await?;
            }
            PeerCommand::SetInterested(interested) => {
                if interested != self.am_interested {
                    if interested {
                        Message::Interested.encode(out).await?;
                    } else {
                        Message::NotInterested.encode(out).await?;
                    }
                    self.am_interested = interested;
                }
            }
            PeerCommand::Shutdown => {
                if self.am_interested {
                    Message::NotInterested.encode(out).await?;
                }
                return Ok(Some(CloseReason::Requested));
            }
        }

        Ok(None)
    }

    fn send_event(&self, event: PeerEvent) -> anyhow::Result<()> {
        self.events_tx
            .send((self.addr, event))
            .map_err(|_| anyhow::anyhow!("the scheduler is gone"))
    }
}
