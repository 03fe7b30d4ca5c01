use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::Context;
use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;
use url::Url;

use super::{AnnounceEvent, AnnounceRequest, AnnounceResponse};

/// Magic constant identifying the BEP-15 connect request
const PROTOCOL_MAGIC: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// A connection id may be reused for up to a minute after it was issued
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

const BASE_TIMEOUT_SECS: u64 = 15;
const MAX_ATTEMPTS: u32 = 4;

/// The tracker exhausted its full retry schedule without answering. The
/// caller marks it dead for the rest of the session.
#[derive(Error, Debug)]
#[error("UDP tracker timed out on all retries")]
pub(super) struct TrackerTimedOut;

fn event_code(event: Option<AnnounceEvent>) -> u32 {
    match event {
        None => 0,
        Some(AnnounceEvent::Completed) => 1,
        Some(AnnounceEvent::Started) => 2,
        Some(AnnounceEvent::Stopped) => 3,
    }
}

fn connect_frame(transaction_id: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(16);
    frame.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    frame.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame
}

fn announce_frame(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    request: &AnnounceRequest<'_>,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(98);
    frame.extend_from_slice(&connection_id.to_be_bytes());
    frame.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(request.info_hash);
    frame.extend_from_slice(request.peer_id);
    frame.extend_from_slice(&request.totals.downloaded.to_be_bytes());
    frame.extend_from_slice(&request.totals.left.to_be_bytes());
    frame.extend_from_slice(&request.totals.uploaded.to_be_bytes());
    frame.extend_from_slice(&event_code(request.event).to_be_bytes());
    // ip 0 (tracker uses the datagram source), random key, num_want -1
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.extend_from_slice(&key.to_be_bytes());
    frame.extend_from_slice(&(-1i32).to_be_bytes());
    frame.extend_from_slice(&request.port.to_be_bytes());
    frame
}

/// Announce response payload, transaction header already stripped:
/// `interval(4) leechers(4) seeders(4)` followed by 6-byte peers
fn parse_announce_payload(payload: &[u8]) -> anyhow::Result<AnnounceResponse> {
    if payload.len() < 12 {
        anyhow::bail!("announce response is too short: {} bytes", payload.len());
    }

    let interval = u32::from_be_bytes(payload[0..4].try_into().expect("4-byte slice"));

    let peers = payload[12..]
        .chunks_exact(6)
        .map(|chunk| {
            let ip: [u8; 4] = chunk[..4].try_into().expect("4-byte slice");
            let port = u16::from_be_bytes(chunk[4..6].try_into().expect("2-byte slice"));
            SocketAddr::new(IpAddr::from(ip), port)
        })
        .collect();

    Ok(AnnounceResponse {
        interval: Some(interval.into()),
        peers,
    })
}

/// Sends `frame` and waits for a response with a matching transaction id.
/// Datagrams with the wrong id are discarded. `Ok(None)` is a timeout; the
/// caller retries with a doubled window per BEP-15.
async fn exchange(
    socket: &UdpSocket,
    frame: &[u8],
    transaction_id: u32,
    expected_action: u32,
    attempt: u32,
) -> anyhow::Result<Option<Vec<u8>>> {
    socket.send(frame).await.context("sending a tracker datagram")?;

    let deadline = Instant::now() + Duration::from_secs(BASE_TIMEOUT_SECS << attempt);
    let mut buf = vec![0u8; 4096];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }

        let received = match tokio::time::timeout(remaining, socket.recv(&mut buf)).await {
            Err(_) => return Ok(None),
            Ok(received) => received.context("receiving a tracker datagram")?,
        };

        if received < 8 {
            continue;
        }

        let action = u32::from_be_bytes(buf[0..4].try_into().expect("4-byte slice"));
        let echoed_id = u32::from_be_bytes(buf[4..8].try_into().expect("4-byte slice"));

        if echoed_id != transaction_id {
            tracing::debug!(echoed_id, transaction_id, "discarding a mismatched transaction id");
            continue;
        }

        if action == ACTION_ERROR {
            let message = String::from_utf8_lossy(&buf[8..received]).into_owned();
            anyhow::bail!("tracker returned an error: {message}");
        }

        if action != expected_action {
            continue;
        }

        return Ok(Some(buf[8..received].to_vec()));
    }
}

async fn obtain_connection_id(socket: &UdpSocket) -> anyhow::Result<u64> {
    for attempt in 0..MAX_ATTEMPTS {
        let transaction_id = rand::thread_rng().gen();

        match exchange(socket, &connect_frame(transaction_id), transaction_id, ACTION_CONNECT, attempt).await? {
            Some(payload) if payload.len() >= 8 => {
                return Ok(u64::from_be_bytes(payload[0..8].try_into().expect("8-byte slice")));
            }
            Some(_) => anyhow::bail!("connect response is missing the connection id"),
            None => continue,
        }
    }

    Err(TrackerTimedOut.into())
}

pub(super) async fn announce(url: &str, request: &AnnounceRequest<'_>) -> anyhow::Result<AnnounceResponse> {
    let url = Url::parse(url).context("tracker announce URL parsing")?;
    let host = url.host_str().context("announce URL without a host")?;
    let port = url.port().unwrap_or(80);

    let addr = tokio::net::lookup_host((host, port))
        .await
        .context("resolving the tracker host")?
        .next()
        .context("the tracker host resolved to no addresses")?;

    let socket = UdpSocket::bind("0.0.0.0:0").await.context("binding a UDP socket")?;
    socket.connect(addr).await.context("connecting the UDP socket")?;

    let mut connection_id = obtain_connection_id(&socket).await?;
    let mut connected_at = Instant::now();

    for attempt in 0..MAX_ATTEMPTS {
        if connected_at.elapsed() >= CONNECTION_ID_TTL {
            connection_id = obtain_connection_id(&socket).await?;
            connected_at = Instant::now();
        }

        let transaction_id = rand::thread_rng().gen();
        let key = rand::thread_rng().gen();
        let frame = announce_frame(connection_id, transaction_id, key, request);

        match exchange(&socket, &frame, transaction_id, ACTION_ANNOUNCE, attempt).await? {
            Some(payload) => return parse_announce_payload(&payload),
            None => continue,
        }
    }

    Err(TrackerTimedOut.into())
}
