use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::metainfo::Metainfo;
use crate::peer::{PeerEvent, SwarmEvent};
use crate::scheduler::{DownloadOutcome, Scheduler, SchedulerConfig};
use crate::session_manager::SessionManager;
use crate::stats::{Progress, StatsPrinter};
use crate::store::PieceStore;
use crate::tracker::{AnnounceEvent, TrackerClient};
use crate::{util, Error, Result};

/// What the CLI (or a test harness) hands to the engine
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub torrent: PathBuf,
    pub output_dir: PathBuf,
    pub port: Option<u16>,
    pub max_peers: usize,
    /// Peers to dial in addition to whatever the trackers return
    pub extra_peers: Vec<SocketAddr>,
}

/// Runs one download to completion: discovers peers, drives the swarm,
/// verifies and persists every piece, and says goodbye to the tracker.
pub async fn download(options: ClientOptions) -> Result<()> {
    let torrent_file = tokio::fs::read(&options.torrent).await?;
    let metainfo = Metainfo::from_bytes(&torrent_file)?;

    tracing::info!(
        name = %metainfo.name,
        size = metainfo.total_length,
        pieces = metainfo.piece_count(),
        trackers = metainfo.announce_tiers.iter().map(|tier| tier.len()).sum::<usize>(),
        "torrent loaded"
    );

    let peer_id = util::generate_peer_id();
    let (listener, port) = util::bind_listen_port(options.port).await?;

    let progress = Arc::new(Progress::new(metainfo.total_length, metainfo.piece_count()));

    let mut tracker = TrackerClient::new(
        metainfo.announce_tiers.clone(),
        metainfo.info_hash,
        peer_id,
        port,
    )
    .map_err(|_| Error::InternalError("failed to construct the tracker client"))?;

    let discovered = tracker
        .announce(Some(AnnounceEvent::Started), progress.totals())
        .await;
    tracing::info!(peers = discovered.peers.len(), "peer discovery finished");

    let mut initial_peers = discovered.peers;
    initial_peers.extend(&options.extra_peers);
    if initial_peers.is_empty() {
        return Err(Error::NoPeers);
    }

    let store = {
        let metainfo = metainfo.clone();
        let output_dir = options.output_dir.clone();
        tokio::task::spawn_blocking(move || PieceStore::new(&metainfo, &output_dir))
            .await
            .map_err(|_| Error::InternalError("the store setup task panicked"))?
            .map_err(to_client_error)?
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel::<(SocketAddr, PeerEvent)>();
    let (broadcast_tx, _) = broadcast::channel::<SwarmEvent>(1024);
    let (addr_tx, addr_rx) = mpsc::unbounded_channel::<Vec<SocketAddr>>();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let scheduler = Scheduler::new(
        store,
        events_rx,
        broadcast_tx.clone(),
        shutdown_rx,
        progress.clone(),
        SchedulerConfig::default(),
    );
    let mut scheduler_task = tokio::spawn(scheduler.run());

    let manager = SessionManager::new(
        metainfo.info_hash,
        peer_id,
        metainfo.piece_count(),
        options.max_peers,
        progress.clone(),
        addr_rx,
        events_tx.clone(),
        broadcast_tx.clone(),
    );
    let manager_task = tokio::spawn(manager.run());

    addr_tx
        .send(initial_peers)
        .map_err(|_| Error::InternalError("the session manager is gone before the download started"))?;

    let announcer_task = tokio::spawn(announce_loop(
        tracker,
        addr_tx,
        progress.clone(),
        broadcast_tx.subscribe(),
        discovered.interval,
    ));

    let stats_task = tokio::spawn(StatsPrinter::new(progress.clone(), broadcast_tx.subscribe()).run());

    let outcome = tokio::select! {
        result = &mut scheduler_task => scheduler_outcome(result),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(());
            scheduler_outcome(scheduler_task.await)
        }
    };

    // the scheduler broadcasts the shutdown on its own clean exits, but not
    // when it aborts with an error; repeating it is harmless and guarantees
    // that sessions, the announcer, and the stats printer all wind down
    let _ = broadcast_tx.send(SwarmEvent::Shutdown);

    if let Err(e) = manager_task.await {
        tracing::debug!(error = %e, "the session manager task failed");
    }
    if let Err(e) = announcer_task.await {
        tracing::debug!(error = %e, "the announcer task failed");
    }
    let _ = stats_task.await;
    drop(listener);
    drop(events_tx);

    match outcome? {
        DownloadOutcome::Complete => {
            tracing::info!(output = %options.output_dir.display(), "payload written");
            Ok(())
        }
        DownloadOutcome::Cancelled => Err(Error::Cancelled),
    }
}

fn scheduler_outcome(
    result: std::result::Result<anyhow::Result<DownloadOutcome>, tokio::task::JoinError>,
) -> Result<DownloadOutcome> {
    match result {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(to_client_error(e)),
        Err(_) => Err(Error::InternalError("the scheduler task panicked")),
    }
}

/// Narrows an engine failure to the typed error the exit-code mapping needs
fn to_client_error(e: anyhow::Error) -> Error {
    match e.downcast::<Error>() {
        Ok(error) => error,
        Err(e) => match e.downcast::<std::io::Error>() {
            Ok(io_error) => Error::IoError(io_error),
            Err(e) => {
                tracing::error!("unrecoverable engine failure: {:#}", e);
                Error::InternalError("unrecoverable engine failure")
            }
        },
    }
}

/// Re-announces on the tracker's interval, feeding fresh peers to the
/// session manager, and files the final announces at shutdown.
async fn announce_loop(
    mut tracker: TrackerClient,
    addr_tx: mpsc::UnboundedSender<Vec<SocketAddr>>,
    progress: Arc<Progress>,
    mut shutdown_rx: broadcast::Receiver<SwarmEvent>,
    mut interval: Duration,
) {
    const MIN_INTERVAL: Duration = Duration::from_secs(60);

    loop {
        interval = interval.max(MIN_INTERVAL);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let discovered = tracker.announce(None, progress.totals()).await;
                interval = discovered.interval;

                if !discovered.peers.is_empty() && addr_tx.send(discovered.peers).is_err() {
                    break;
                }
            }
            event = shutdown_rx.recv() => {
                match event {
                    Ok(SwarmEvent::PieceCommitted(_))
                    | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Ok(SwarmEvent::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    if progress.is_complete() {
        let _ = tracker
            .announce(Some(AnnounceEvent::Completed), progress.totals())
            .await;
    }
    tracker.announce_stopped(progress.totals()).await;
}

impl ClientOptions {
    pub fn from_args(args: crate::args::Arguments) -> Self {
        ClientOptions {
            torrent: args.file,
            output_dir: args.output_dir,
            port: args.port,
            max_peers: args.max_peers,
            extra_peers: args.peers,
        }
    }
}
