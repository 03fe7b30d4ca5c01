use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use bittorrent_wire::{Block, BlockRequest, BLOCK_LENGTH};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::peer::{CloseReason, PeerCommand, PeerEvent, SwarmEvent};
use crate::picker::Picker;
use crate::stats::Progress;
use crate::store::{CommitOutcome, PieceStore};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Complete,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Outstanding requests a single session may hold
    pub pipeline_depth: usize,
    /// How long a block may stay in flight before it is reassigned
    pub block_timeout: Duration,
    /// Lowered reassignment threshold once the endgame starts
    pub endgame_block_timeout: Duration,
    /// The endgame starts when fewer unfinished pieces remain than this
    pub endgame_piece_threshold: usize,
    /// A choked session keeps its outstanding requests for this long; the
    /// remote may still honour them
    pub choke_grace: Duration,
    /// Hash failures per piece before the download aborts
    pub max_piece_retries: u32,
    /// Sessions scoring below this (bytes/s) are closed as unhealthy
    pub score_floor: f64,
    /// Minimum delivered blocks before the score floor applies
    pub min_score_samples: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            pipeline_depth: 5,
            block_timeout: Duration::from_secs(30),
            endgame_block_timeout: Duration::from_secs(15),
            endgame_piece_threshold: 10,
            choke_grace: Duration::from_secs(2),
            max_piece_retries: 5,
            score_floor: 2048.,
            min_score_samples: 5,
        }
    }
}

/// The scheduler's mirror of one live session
#[derive(Debug)]
struct PeerHandle {
    commands: mpsc::Sender<PeerCommand>,
    peer_id: [u8; 20],
    bitfield: BitVec<u8, Msb0>,
    peer_choking: bool,
    am_interested: bool,
    /// Set when the peer chokes us; outstanding requests are reclaimed once
    /// the grace window passes
    choked_at: Option<Instant>,
    pending: HashMap<BlockRequest, Instant>,
    /// Exponentially weighted moving average of delivered bytes per second
    score: f64,
    samples: u32,
    healthy: bool,
}

impl PeerHandle {
    const SCORE_SMOOTHING: f64 = 0.3;

    fn new(peer_id: [u8; 20], commands: mpsc::Sender<PeerCommand>, piece_count: usize) -> Self {
        PeerHandle {
            commands,
            peer_id,
            bitfield: BitVec::repeat(false, piece_count),
            peer_choking: true,
            am_interested: false,
            choked_at: None,
            pending: HashMap::new(),
            score: 0.,
            samples: 0,
            healthy: true,
        }
    }

    fn record_rate(&mut self, bytes_per_sec: f64) {
        self.score = if self.samples == 0 {
            bytes_per_sec
        } else {
            (1. - Self::SCORE_SMOOTHING) * self.score + Self::SCORE_SMOOTHING * bytes_per_sec
        };
        self.samples += 1;
    }

    fn has_request_slot(&self, pipeline_depth: usize) -> bool {
        !self.peer_choking && self.healthy && self.pending.len() < pipeline_depth
    }
}

/// The download driver.
///
/// Single owner of the piece table, the rarity counts, and the peer
/// registry: sessions talk to it exclusively through channels, so the
/// bookkeeping invariants hold without locks.
pub struct Scheduler {
    store: PieceStore,
    picker: Picker,
    peers: HashMap<SocketAddr, PeerHandle>,
    events_rx: mpsc::UnboundedReceiver<(SocketAddr, PeerEvent)>,
    broadcast_tx: broadcast::Sender<SwarmEvent>,
    progress: Arc<Progress>,
    shutdown_rx: oneshot::Receiver<()>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: PieceStore,
        events_rx: mpsc::UnboundedReceiver<(SocketAddr, PeerEvent)>,
        broadcast_tx: broadcast::Sender<SwarmEvent>,
        shutdown_rx: oneshot::Receiver<()>,
        progress: Arc<Progress>,
        config: SchedulerConfig,
    ) -> Self {
        let picker = Picker::new(store.piece_count());

        Scheduler {
            store,
            picker,
            peers: HashMap::new(),
            events_rx,
            broadcast_tx,
            progress,
            shutdown_rx,
            config,
        }
    }

    #[tracing::instrument(skip(self), fields(pieces = self.store.piece_count()))]
    pub async fn run(mut self) -> anyhow::Result<DownloadOutcome> {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    let (addr, event) = event.context("bug: every event sender dropped mid-download?")?;
                    if let Some(outcome) = self.handle_event(addr, event).await? {
                        return Ok(outcome);
                    }
                }
                _ = tick.tick() => {
                    self.sweep_timeouts();
                    self.enforce_choke_grace();
                    self.close_unhealthy_sessions();
                    self.top_up_all();
                }
                _ = &mut self.shutdown_rx => {
                    tracing::info!("shutdown requested, closing all sessions");
                    let _ = self.broadcast_tx.send(SwarmEvent::Shutdown);
                    return Ok(DownloadOutcome::Cancelled);
                }
            }
        }
    }

    async fn handle_event(
        &mut self,
        addr: SocketAddr,
        event: PeerEvent,
    ) -> anyhow::Result<Option<DownloadOutcome>> {
        match event {
            PeerEvent::Connected { peer_id, commands } => {
                // A second connection claiming an already seen peer id is a
                // duplicate; the newer one loses
                if self.peers.values().any(|peer| peer.peer_id == peer_id) {
                    tracing::debug!(?addr, "duplicate peer id, closing the newer connection");
                    let _ = commands.try_send(PeerCommand::Shutdown);
                    return Ok(None);
                }

                self.peers
                    .insert(addr, PeerHandle::new(peer_id, commands, self.store.piece_count()));
                self.progress.set_peers(self.peers.len());
            }
            PeerEvent::Bitfield(bitfield) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    self.picker.peer_removed(&peer.bitfield);
                    peer.bitfield = bitfield;
                    self.picker.peer_added(&peer.bitfield);
                }
                self.update_interest(addr);
                self.top_up(addr);
            }
            PeerEvent::Have(index) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    if index as usize >= peer.bitfield.len() {
                        return Ok(None);
                    }
                    peer.bitfield.set(index as usize, true);
                    self.picker.peer_has(index);
                }
                self.update_interest(addr);
                self.top_up(addr);
            }
            PeerEvent::Unchoked => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_choking = false;
                    peer.choked_at = None;
                }
                self.top_up(addr);
            }
            PeerEvent::Choked => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_choking = true;
                    peer.choked_at = Some(Instant::now());
                }
            }
            PeerEvent::Block(block) => return self.handle_block(addr, block).await,
            PeerEvent::Closed(reason) => self.handle_closed(addr, reason),
        }

        Ok(None)
    }

    async fn handle_block(
        &mut self,
        addr: SocketAddr,
        block: Block,
    ) -> anyhow::Result<Option<DownloadOutcome>> {
        let request = BlockRequest::new(block.index, block.begin, block.block.len() as u32);
        let now = Instant::now();

        if let Some(peer) = self.peers.get_mut(&addr) {
            if let Some(requested_at) = peer.pending.remove(&request) {
                let elapsed = now.duration_since(requested_at).as_secs_f64().max(0.001);
                peer.record_rate(block.block.len() as f64 / elapsed);
            } else {
                // late delivery after a timeout or an endgame cancel; still
                // validated and used if the block is needed
                tracing::trace!(?addr, ?request, "block arrived without a pending request");
            }
        }

        match self.store.write_block(addr, &block) {
            Ok(crate::piece::WriteOutcome::Accepted { piece_complete, duplicates }) => {
                for other in duplicates {
                    if let Some(other_peer) = self.peers.get_mut(&other) {
                        other_peer.pending.remove(&request);
                        let _ = other_peer.commands.try_send(PeerCommand::Cancel(request));
                    }
                }

                if piece_complete {
                    if let Some(outcome) = self.commit_piece(block.index).await? {
                        return Ok(Some(outcome));
                    }
                }
            }
            Ok(crate::piece::WriteOutcome::Discarded) => {}
            Err(e) => {
                // out-of-range or malformed blocks are a protocol offence
                tracing::debug!(?addr, error = %e, "dropping a peer that sent an invalid block");
                self.penalize(addr, 0.25);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    let _ = peer.commands.try_send(PeerCommand::Shutdown);
                }
            }
        }

        self.top_up(addr);

        Ok(None)
    }

    async fn commit_piece(&mut self, index: u32) -> anyhow::Result<Option<DownloadOutcome>> {
        match self
            .store
            .verify_and_commit(index)
            .await
            .context("error while committing a piece")?
        {
            CommitOutcome::Committed { bytes } => {
                tracing::debug!(piece = index, "piece committed");
                self.progress.mark_committed(index, bytes as u64);
                let _ = self.broadcast_tx.send(SwarmEvent::PieceCommitted(index));

                if self.store.is_complete() {
                    tracing::info!("all pieces committed, download complete");
                    self.store.sync().await.context("error while flushing the output files")?;
                    let _ = self.broadcast_tx.send(SwarmEvent::Shutdown);
                    return Ok(Some(DownloadOutcome::Complete));
                }
            }
            CommitOutcome::HashMismatch { retries, contributors } => {
                tracing::warn!(piece = index, retries, "piece failed verification, resetting");

                // a peer that was the sole source of a bad piece is
                // unambiguously at fault
                let sole_source = contributors.len() == 1;
                for contributor in contributors {
                    self.penalize(contributor, if sole_source { 0.25 } else { 0.5 });
                }

                if retries > self.config.max_piece_retries {
                    return Err(Error::PieceUnrecoverable(index).into());
                }
            }
        }

        Ok(None)
    }

    fn handle_closed(&mut self, addr: SocketAddr, reason: CloseReason) {
        let Some(peer) = self.peers.remove(&addr) else {
            return;
        };
        tracing::debug!(?addr, ?reason, "session closed");

        self.picker.peer_removed(&peer.bitfield);
        let released = self.store.release_peer(addr);
        if !released.is_empty() {
            tracing::debug!(?addr, blocks = released.len(), "reclaimed in-flight blocks");
        }

        self.progress.set_peers(self.peers.len());
        self.top_up_all();
    }

    /// We are interested in a peer exactly while it holds a piece we lack
    fn update_interest(&mut self, addr: SocketAddr) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };

        let interested = self
            .store
            .pieces()
            .iter()
            .any(|piece| piece.is_downloadable() && peer.bitfield[piece.index as usize]);

        if interested != peer.am_interested {
            peer.am_interested = interested;
            let _ = peer.commands.try_send(PeerCommand::SetInterested(interested));
        }
    }

    fn in_endgame(&self) -> bool {
        self.store.remaining_pieces() < self.config.endgame_piece_threshold
    }

    /// Keeps a session's request pipeline full while work exists for it
    fn top_up(&mut self, addr: SocketAddr) {
        let now = Instant::now();
        let endgame = self.in_endgame();

        loop {
            let Some(peer) = self.peers.get(&addr) else {
                return;
            };
            if !peer.has_request_slot(self.config.pipeline_depth) {
                return;
            }

            let Some(request) = self.next_request_for(addr, endgame, now) else {
                return;
            };

            let peer = self.peers.get_mut(&addr).expect("peer checked above");
            peer.pending.insert(request, now);

            if peer.commands.try_send(PeerCommand::Request(request)).is_err() {
                // command queue full or the session is going away; undo
                peer.pending.remove(&request);
                if let Some(piece) = self.store.piece_mut(request.index) {
                    piece.release_assignment(request.begin, addr);
                }
                return;
            }
        }
    }

    /// Every decision point tops up every eligible session, best scores
    /// first
    fn top_up_all(&mut self) {
        let mut candidates: Vec<(SocketAddr, f64)> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.has_request_slot(self.config.pipeline_depth))
            .map(|(addr, peer)| (*addr, peer.score))
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (addr, _) in candidates {
            self.top_up(addr);
        }
    }

    /// Picks the next block to request from a peer: rarest-first piece
    /// selection, lowest free block inside the piece, endgame duplication
    /// when nothing fresh is left.
    fn next_request_for(&mut self, addr: SocketAddr, endgame: bool, now: Instant) -> Option<BlockRequest> {
        let bitfield = self.peers.get(&addr)?.bitfield.clone();

        let mut rng = rand::thread_rng();
        if let Some(index) = self.picker.pick_piece(self.store.pieces(), &bitfield, &mut rng) {
            let piece = self.store.piece_mut(index)?;
            let block_idx = piece.next_free_block()?;
            return Some(piece.assign(block_idx, addr, now));
        }

        if endgame {
            return self.assign_endgame_duplicate(addr, &bitfield, now);
        }

        None
    }

    /// In the endgame, outstanding requests are duplicated across idle
    /// peers; the first response wins and the rest are cancelled
    fn assign_endgame_duplicate(
        &mut self,
        addr: SocketAddr,
        bitfield: &BitVec<u8, Msb0>,
        now: Instant,
    ) -> Option<BlockRequest> {
        let pending = &self.peers.get(&addr)?.pending;

        let mut target = None;
        'pieces: for piece in self.store.pieces() {
            if !piece.is_downloadable() || !bitfield[piece.index as usize] {
                continue;
            }
            for (request, assignments) in piece.in_flight() {
                if pending.contains_key(&request) {
                    continue;
                }
                if assignments.iter().any(|assignment| assignment.peer == addr) {
                    continue;
                }
                target = Some(request);
                break 'pieces;
            }
        }

        let request = target?;
        let piece = self.store.piece_mut(request.index)?;
        Some(piece.assign((request.begin / BLOCK_LENGTH) as usize, addr, now))
    }

    /// A block in flight for too long is considered lost: cancel it, free
    /// it, and penalize the peer that sat on it
    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let timeout = if self.in_endgame() {
            self.config.endgame_block_timeout
        } else {
            self.config.block_timeout
        };

        let expired: Vec<(BlockRequest, SocketAddr)> = self
            .store
            .pieces()
            .iter()
            .flat_map(|piece| piece.timed_out(now, timeout))
            .collect();

        for (request, addr) in expired {
            tracing::debug!(?addr, ?request, "block request timed out");

            if let Some(piece) = self.store.piece_mut(request.index) {
                piece.release_assignment(request.begin, addr);
            }
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.pending.remove(&request);
                let _ = peer.commands.try_send(PeerCommand::Cancel(request));
            }
            self.penalize(addr, 0.5);
        }
    }

    /// A choke drops the session's outstanding requests, but only after a
    /// grace window: the remote may still answer them
    fn enforce_choke_grace(&mut self) {
        let now = Instant::now();
        let grace = self.config.choke_grace;

        let expired: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, peer)| {
                peer.choked_at
                    .is_some_and(|choked_at| now.duration_since(choked_at) >= grace)
                    && !peer.pending.is_empty()
            })
            .map(|(addr, _)| *addr)
            .collect();

        for addr in expired {
            let Some(peer) = self.peers.get_mut(&addr) else {
                continue;
            };
            let requests: Vec<BlockRequest> = peer.pending.drain().map(|(request, _)| request).collect();
            peer.choked_at = None;

            tracing::debug!(?addr, blocks = requests.len(), "reclaiming requests from a choked session");
            for request in requests {
                if let Some(piece) = self.store.piece_mut(request.index) {
                    piece.release_assignment(request.begin, addr);
                }
            }
        }
    }

    /// Sessions under the score floor are closed once their pipeline drains
    fn close_unhealthy_sessions(&mut self) {
        for (addr, peer) in self.peers.iter_mut() {
            if peer.healthy
                && peer.samples >= self.config.min_score_samples
                && peer.score < self.config.score_floor
                && peer.pending.is_empty()
            {
                tracing::debug!(?addr, score = peer.score, "closing an unhealthy session");
                peer.healthy = false;
                let _ = peer.commands.try_send(PeerCommand::Shutdown);
            }
        }
    }

    fn penalize(&mut self, addr: SocketAddr, factor: f64) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.score *= factor;
            peer.samples = peer.samples.max(1);
        }
    }
}
