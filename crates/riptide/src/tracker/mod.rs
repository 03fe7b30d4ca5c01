mod http;
mod udp;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

/// Announce event, as understood by both tracker flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

/// Transfer totals reported to trackers
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferTotals {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Everything a single announce needs, regardless of transport
#[derive(Debug, Clone, Copy)]
pub(crate) struct AnnounceRequest<'a> {
    pub info_hash: &'a [u8; 20],
    pub peer_id: &'a [u8; 20],
    pub port: u16,
    pub totals: TransferTotals,
    pub event: Option<AnnounceEvent>,
}

#[derive(Debug)]
pub(crate) struct AnnounceResponse {
    pub interval: Option<u64>,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug)]
pub struct Discovered {
    pub peers: Vec<SocketAddr>,
    /// Seconds the responding tracker asked us to wait between announces
    pub interval: Duration,
}

/// Tracker-agnostic peer discovery over the announce tiers of a torrent.
///
/// Trackers within a tier are tried in order and the first responder is
/// promoted to the tier's head for subsequent announces. Tiers are walked
/// until enough unique addresses have been collected.
pub struct TrackerClient {
    tiers: Vec<Vec<String>>,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    http: reqwest::Client,
    /// UDP trackers that exhausted their retry schedule this session
    dead: HashSet<String>,
    peer_target: usize,
}

impl TrackerClient {
    pub const DEFAULT_PEER_TARGET: usize = 30;
    const DEFAULT_INTERVAL_SECS: u64 = 1800;

    pub fn new(tiers: Vec<Vec<String>>, info_hash: [u8; 20], peer_id: [u8; 20], port: u16) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(10))
            .build()
            .context("building the announce HTTP client")?;

        Ok(TrackerClient {
            tiers,
            info_hash,
            peer_id,
            port,
            http,
            dead: HashSet::new(),
            peer_target: Self::DEFAULT_PEER_TARGET,
        })
    }

    /// Walks the announce tiers and returns the union of discovered peers.
    ///
    /// Stops as soon as the peer target is reached; remaining tiers are left
    /// for later announces.
    #[tracing::instrument(skip(self), fields(tiers = self.tiers.len()))]
    pub async fn announce(
        &mut self,
        event: Option<AnnounceEvent>,
        totals: TransferTotals,
    ) -> Discovered {
        let mut peers: HashSet<SocketAddr> = HashSet::new();
        let mut interval = None;

        for tier_idx in 0..self.tiers.len() {
            if peers.len() >= self.peer_target {
                break;
            }

            if let Some(responder) = self.announce_tier(tier_idx, event, totals, &mut peers, &mut interval).await {
                // The responding tracker moves to the head of its tier so
                // later announces try it first
                let tier = &mut self.tiers[tier_idx];
                if responder != 0 {
                    let url = tier.remove(responder);
                    tier.insert(0, url);
                }
            }
        }

        Discovered {
            peers: peers.into_iter().collect(),
            interval: Duration::from_secs(interval.unwrap_or(Self::DEFAULT_INTERVAL_SECS)),
        }
    }

    /// Announces `stopped` to every tier head that is still alive. Failures
    /// are logged and swallowed: shutdown must not hang on a dead tracker.
    pub async fn announce_stopped(&mut self, totals: TransferTotals) {
        for tier in self.tiers.clone() {
            let Some(url) = tier.first() else { continue };
            if self.dead.contains(url) {
                continue;
            }

            if let Err(e) = self.announce_url(url, Some(AnnounceEvent::Stopped), totals).await {
                tracing::debug!(url, error = %e, "stopped announce failed");
            }
        }
    }

    /// Tries every tracker of one tier in order, collecting peers. Returns
    /// the index of the first responder, if any.
    async fn announce_tier(
        &mut self,
        tier_idx: usize,
        event: Option<AnnounceEvent>,
        totals: TransferTotals,
        peers: &mut HashSet<SocketAddr>,
        interval: &mut Option<u64>,
    ) -> Option<usize> {
        let tier = self.tiers[tier_idx].clone();
        let mut responder = None;

        for (tracker_idx, url) in tier.iter().enumerate() {
            if self.dead.contains(url) {
                continue;
            }

            match self.announce_url(url, event, totals).await {
                Ok(response) => {
                    tracing::debug!(url, peers = response.peers.len(), "tracker responded");

                    peers.extend(response.peers);
                    if interval.is_none() {
                        *interval = response.interval;
                    }
                    responder.get_or_insert(tracker_idx);

                    if peers.len() >= self.peer_target {
                        break;
                    }
                }
                Err(e) => {
                    if e.is::<udp::TrackerTimedOut>() {
                        tracing::warn!(url, "UDP tracker exhausted its retries, marking dead");
                        self.dead.insert(url.clone());
                    } else {
                        tracing::debug!(url, error = %e, "tracker announce failed");
                    }
                }
            }
        }

        responder
    }

    async fn announce_url(
        &self,
        url: &str,
        event: Option<AnnounceEvent>,
        totals: TransferTotals,
    ) -> anyhow::Result<AnnounceResponse> {
        let request = AnnounceRequest {
            info_hash: &self.info_hash,
            peer_id: &self.peer_id,
            port: self.port,
            totals,
            event,
        };

        if url.starts_with("http://") || url.starts_with("https://") {
            http::announce(&self.http, url, &request).await
        } else if url.starts_with("udp://") {
            udp::announce(url, &request).await
        } else {
            anyhow::bail!("unsupported tracker scheme: {url}")
        }
    }
}
