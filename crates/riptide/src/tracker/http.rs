use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{AnnounceEvent, AnnounceRequest, AnnounceResponse};

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum EventName {
    Started,
    Stopped,
    Completed,
}

impl From<AnnounceEvent> for EventName {
    fn from(event: AnnounceEvent) -> Self {
        match event {
            AnnounceEvent::Started => EventName::Started,
            AnnounceEvent::Stopped => EventName::Stopped,
            AnnounceEvent::Completed => EventName::Completed,
        }
    }
}

/// Query parameters of an HTTP announce, minus the two raw-bytes fields
#[derive(Debug, Serialize)]
struct QueryParams {
    /// The port number the client is listening on
    port: u16,
    /// The total amount uploaded
    uploaded: u64,
    /// The total amount downloaded
    downloaded: u64,
    /// The number of bytes the client still has to download
    left: u64,
    /// States that the client accepts a compact response. Always 1
    compact: u8,
    /// How many peers we would like to receive
    numwant: u32,
    /// Omitted for the regular announces between events
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<EventName>,
}

fn build_query(request: &AnnounceRequest<'_>) -> anyhow::Result<String> {
    let params = QueryParams {
        port: request.port,
        uploaded: request.totals.uploaded,
        downloaded: request.totals.downloaded,
        left: request.totals.left,
        compact: 1,
        numwant: 50,
        event: request.event.map(Into::into),
    };

    // NOTE: serde can't serialize the two 20-byte fields as the raw
    // URL-escaped bytes trackers expect, so they are appended by hand
    let mut query = serde_urlencoded::to_string(params).context("failed to serialize the announce request")?;

    query.push_str("&info_hash=");
    query.extend(form_urlencoded::byte_serialize(request.info_hash));
    query.push_str("&peer_id=");
    query.extend(form_urlencoded::byte_serialize(request.peer_id));

    Ok(query)
}

fn announce_url(url: &str, request: &AnnounceRequest<'_>) -> anyhow::Result<Url> {
    let mut url = Url::parse(url).context("tracker announce URL parsing")?;

    let mut query = build_query(request)?;

    // NOTE: Some trackers include additional query params in the announce
    // URL, and some require them to stay first in the query, so the existing
    // part is preserved ahead of ours
    if let Some(existing_query) = url.query() {
        query.insert_str(0, existing_query);
        query.insert(existing_query.len(), '&');
    }

    url.set_query(Some(&query));

    Ok(url)
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    /// A human-readable error; when present nothing else is
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    /// Number of seconds to wait between regular announces
    interval: Option<u64>,
    peers: Option<PeerList>,
}

/// Trackers answer with either the BEP-23 compact byte string or the
/// original list-of-dictionaries form
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PeerList {
    Compact(serde_bytes::ByteBuf),
    Dicts(Vec<DictPeer>),
}

#[derive(Debug, Deserialize)]
struct DictPeer {
    ip: String,
    port: u16,
}

/// Each compact peer is a 6-byte value: 4 bytes of IPv4 address followed by
/// a big-endian port
fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip: [u8; 4] = chunk[..4].try_into().expect("4-byte slice");
            let port = u16::from_be_bytes(chunk[4..6].try_into().expect("2-byte slice"));
            SocketAddr::new(IpAddr::from(ip), port)
        })
        .collect()
}

fn parse_dict_peers(peers: &[DictPeer]) -> Vec<SocketAddr> {
    peers
        .iter()
        .filter_map(|peer| match peer.ip.parse::<IpAddr>() {
            Ok(ip) => Some(SocketAddr::new(ip, peer.port)),
            Err(_) => {
                tracing::debug!(ip = %peer.ip, "skipping a peer with an unparsable address");
                None
            }
        })
        .collect()
}

pub(super) async fn announce(
    client: &reqwest::Client,
    url: &str,
    request: &AnnounceRequest<'_>,
) -> anyhow::Result<AnnounceResponse> {
    let url = announce_url(url, request)?;

    let response = client
        .get(url)
        .header("User-Agent", "riptide")
        .send()
        .await
        .context("sending the announce request")?;

    let body = response.bytes().await.context("reading the announce response body")?;
    let response: TrackerResponse =
        serde_bencode::from_bytes(&body).context("error while parsing the tracker's response")?;

    if let Some(reason) = response.failure_reason {
        anyhow::bail!("tracker refused the announce: {reason}");
    }

    let peers = match &response.peers {
        Some(PeerList::Compact(bytes)) => parse_compact_peers(bytes),
        Some(PeerList::Dicts(dicts)) => parse_dict_peers(dicts),
        None => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval: response.interval,
        peers,
    })
}
