use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use tokio::sync::broadcast;
use tokio::time::interval;

use crate::peer::SwarmEvent;
use crate::tracker::TransferTotals;

/// Download state shared between the scheduler (writer), the announcer, the
/// session manager, and the stats printer (readers).
#[derive(Debug)]
pub struct Progress {
    total_bytes: u64,
    piece_count: usize,
    downloaded: AtomicU64,
    pieces_committed: AtomicUsize,
    peers: AtomicUsize,
    committed: RwLock<BitVec<u8, Msb0>>,
}

impl Progress {
    pub fn new(total_bytes: u64, piece_count: usize) -> Self {
        Progress {
            total_bytes,
            piece_count,
            downloaded: AtomicU64::new(0),
            pieces_committed: AtomicUsize::new(0),
            peers: AtomicUsize::new(0),
            committed: RwLock::new(BitVec::repeat(false, piece_count)),
        }
    }

    /// Called by the scheduler once a piece is verified and on disk
    pub fn mark_committed(&self, index: u32, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.pieces_committed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut committed) = self.committed.write() {
            committed.set(index as usize, true);
        }
    }

    pub fn set_peers(&self, peers: usize) {
        self.peers.store(peers, Ordering::Relaxed);
    }

    pub fn peers(&self) -> usize {
        self.peers.load(Ordering::Relaxed)
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn pieces_committed(&self) -> usize {
        self.pieces_committed.load(Ordering::Relaxed)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn is_complete(&self) -> bool {
        self.pieces_committed() >= self.piece_count
    }

    pub fn totals(&self) -> TransferTotals {
        let downloaded = self.downloaded_bytes();
        TransferTotals {
            uploaded: 0,
            downloaded,
            left: self.total_bytes.saturating_sub(downloaded),
        }
    }

    /// Snapshot of the committed pieces for a late-joining session's
    /// post-handshake bitfield. `None` while nothing is committed.
    pub fn committed_bitfield(&self) -> Option<BitVec<u8, Msb0>> {
        let committed = self.committed.read().ok()?;
        if committed.any() {
            let mut bitfield = BitVec::<u8, Msb0>::repeat(false, self.piece_count.div_ceil(8) * 8);
            for index in committed.iter_ones() {
                bitfield.set(index, true);
            }
            Some(bitfield)
        } else {
            None
        }
    }
}

/// Sliding window over the download counter.
///
/// Stores `(sampled_at, downloaded)` pairs and reads the speed off the
/// window ends, so the rate smooths over the whole window regardless of
/// how often the printer samples.
pub(crate) struct SpeedWindow {
    samples: VecDeque<(Instant, u64)>,
    capacity: usize,
}

impl SpeedWindow {
    pub fn new(capacity: usize) -> Self {
        SpeedWindow {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, sampled_at: Instant, downloaded: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((sampled_at, downloaded));
    }

    /// `None` until two samples with measurable distance exist
    pub fn bytes_per_sec(&self) -> Option<f64> {
        let (oldest_at, oldest) = self.samples.front()?;
        let (newest_at, newest) = self.samples.back()?;

        let elapsed = newest_at.duration_since(*oldest_at).as_secs_f64();
        if elapsed <= 0. {
            return None;
        }

        Some((newest - oldest) as f64 / elapsed)
    }
}

/// Periodically logs progress: percent done, speed over a sliding window,
/// ETA, and the live peer count.
pub struct StatsPrinter {
    progress: Arc<Progress>,
    shutdown_rx: broadcast::Receiver<SwarmEvent>,
    printing_interval: Duration,
}

impl StatsPrinter {
    const DEFAULT_PRINTING_INTERVAL: Duration = Duration::from_secs(2);
    const SPEED_WINDOW: usize = 30;

    pub fn new(progress: Arc<Progress>, shutdown_rx: broadcast::Receiver<SwarmEvent>) -> Self {
        StatsPrinter {
            progress,
            shutdown_rx,
            printing_interval: Self::DEFAULT_PRINTING_INTERVAL,
        }
    }

    pub async fn run(mut self) {
        let mut tick = interval(self.printing_interval);
        let mut speed_window = SpeedWindow::new(Self::SPEED_WINDOW);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let downloaded = self.progress.downloaded_bytes();
                    speed_window.record(Instant::now(), downloaded);

                    let Some(bytes_per_sec) = speed_window.bytes_per_sec() else {
                        continue;
                    };
                    if bytes_per_sec <= 0. {
                        continue;
                    }

                    let left = self.progress.total_bytes().saturating_sub(downloaded);
                    let downloaded_percents =
                        (downloaded as f64 / self.progress.total_bytes() as f64) * 100.;

                    tracing::info!(
                        "ETA: {:.0} s - {:.2}% - ↓{:.2} MiB/s - pieces: {}/{} - peers: {}",
                        left as f64 / bytes_per_sec,
                        downloaded_percents,
                        bytes_per_sec / 1024. / 1024.,
                        self.progress.pieces_committed(),
                        self.progress.piece_count(),
                        self.progress.peers()
                    );
                }
                event = self.shutdown_rx.recv() => {
                    match event {
                        Ok(SwarmEvent::PieceCommitted(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Ok(SwarmEvent::Shutdown) | Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!(
                                "downloaded {}/{} pieces, {} bytes",
                                self.progress.pieces_committed(),
                                self.progress.piece_count(),
                                self.progress.downloaded_bytes()
                            );
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_tracks_totals_and_completion() {
        let progress = Progress::new(100, 2);
        assert_eq!(progress.totals().left, 100);
        assert!(!progress.is_complete());
        assert!(progress.committed_bitfield().is_none());

        progress.mark_committed(0, 60);
        progress.mark_committed(1, 40);

        let totals = progress.totals();
        assert_eq!(totals.downloaded, 100);
        assert_eq!(totals.left, 0);
        assert!(progress.is_complete());

        let bitfield = progress.committed_bitfield().expect("some pieces are committed");
        assert!(bitfield[0] && bitfield[1]);
        // the wire bitfield is padded to a whole byte with zero spare bits
        assert_eq!(bitfield.len(), 8);
        assert!(!bitfield[2..].any());
    }

    #[test]
    fn speed_window_reads_the_rate_off_its_ends() {
        let mut window = SpeedWindow::new(4);
        let start = Instant::now();

        assert!(window.bytes_per_sec().is_none());

        window.record(start, 0);
        assert!(window.bytes_per_sec().is_none());

        window.record(start + Duration::from_secs(2), 2048);
        assert_eq!(window.bytes_per_sec(), Some(1024.));
    }

    #[test]
    fn speed_window_drops_the_oldest_sample_at_capacity() {
        let mut window = SpeedWindow::new(2);
        let start = Instant::now();

        window.record(start, 0);
        window.record(start + Duration::from_secs(1), 1000);
        // pushes the zero-byte sample out; the rate now spans 1s and 500 bytes
        window.record(start + Duration::from_secs(2), 1500);

        assert_eq!(window.bytes_per_sec(), Some(500.));
    }
}
