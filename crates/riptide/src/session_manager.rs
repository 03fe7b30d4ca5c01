use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::instrument;

use crate::peer::{PeerEvent, PeerSession, SwarmEvent};
use crate::stats::Progress;

/// Dials discovered peers and keeps the number of live sessions at the
/// configured cap, replacing sessions as they die. Addresses arrive in
/// batches from the announcer and are deduplicated for the whole run.
#[derive(Debug)]
pub struct SessionManager {
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    piece_count: usize,
    max_peers: usize,
    progress: Arc<Progress>,
    addr_rx: mpsc::UnboundedReceiver<Vec<SocketAddr>>,
    events_tx: mpsc::UnboundedSender<(SocketAddr, PeerEvent)>,
    broadcast_tx: broadcast::Sender<SwarmEvent>,
    known: HashSet<SocketAddr>,
    queue: VecDeque<SocketAddr>,
    sessions: JoinSet<anyhow::Result<()>>,
}

impl SessionManager {
    /// How long finished sessions get to say goodbye before being aborted
    const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        piece_count: usize,
        max_peers: usize,
        progress: Arc<Progress>,
        addr_rx: mpsc::UnboundedReceiver<Vec<SocketAddr>>,
        events_tx: mpsc::UnboundedSender<(SocketAddr, PeerEvent)>,
        broadcast_tx: broadcast::Sender<SwarmEvent>,
    ) -> Self {
        SessionManager {
            info_hash,
            peer_id,
            piece_count,
            max_peers,
            progress,
            addr_rx,
            events_tx,
            broadcast_tx,
            known: HashSet::new(),
            queue: VecDeque::new(),
            sessions: JoinSet::new(),
        }
    }

    #[instrument(skip(self), fields(max_peers = self.max_peers))]
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.broadcast_tx.subscribe();
        let mut announcer_gone = false;

        loop {
            tokio::select! {
                addrs = self.addr_rx.recv(), if !announcer_gone => {
                    match addrs {
                        Some(addrs) => {
                            self.enqueue(addrs);
                            self.fill();
                        }
                        // the announcer is gone; keep serving what we have
                        None => announcer_gone = true,
                    }
                }
                Some(result) = self.sessions.join_next(), if !self.sessions.is_empty() => {
                    if let Err(e) = result.context("a peer session task failed to execute")? {
                        tracing::debug!("a peer session ended with an error: {:#}", e);
                    }
                    self.fill();
                }
                event = shutdown_rx.recv() => {
                    match event {
                        Ok(SwarmEvent::PieceCommitted(_))
                        | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Ok(SwarmEvent::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        self.drain().await;

        Ok(())
    }

    fn enqueue(&mut self, addrs: Vec<SocketAddr>) {
        for addr in addrs {
            if self.known.insert(addr) {
                self.queue.push_back(addr);
            }
        }
    }

    fn fill(&mut self) {
        while self.sessions.len() < self.max_peers {
            let Some(addr) = self.queue.pop_front() else {
                return;
            };

            tracing::debug!(%addr, "dialling a new peer");
            let session = PeerSession::new(
                addr,
                self.info_hash,
                self.peer_id,
                self.piece_count,
                self.progress.committed_bitfield(),
                self.events_tx.clone(),
                self.broadcast_tx.subscribe(),
            );
            self.sessions.spawn(session.run());
        }
    }

    /// Sessions already got the shutdown broadcast; give them a moment to
    /// close cleanly, then cut the stragglers off
    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + Self::DRAIN_TIMEOUT;

        while !self.sessions.is_empty() {
            match tokio::time::timeout_at(deadline, self.sessions.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(stragglers = self.sessions.len(), "aborting sessions that did not close in time");
                    self.sessions.abort_all();
                    while self.sessions.join_next().await.is_some() {}
                    break;
                }
            }
        }
    }
}
