//! End-to-end downloads against in-process peers speaking the real wire
//! protocol.

use std::borrow::Cow;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bittorrent_wire::{Decode, Encode, FrameDecoder, Handshake, Message};
use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use bytes::Bytes;
use riptide::metainfo::{RawFile, RawInfo};
use riptide::{ClientOptions, Error};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

const TEST_DEADLINE: Duration = Duration::from_secs(60);

fn sha1(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn deterministic_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

struct TorrentSpec<'a> {
    name: &'a str,
    piece_length: usize,
    payload: &'a [u8],
    /// (file name, length); empty means single-file mode
    files: Vec<(&'a str, usize)>,
    announce: &'a str,
    announce_tiers: Vec<Vec<String>>,
}

/// Builds a bencoded torrent file the same way a tracker-side tool would
fn build_torrent(spec: &TorrentSpec<'_>) -> Vec<u8> {
    let pieces: Vec<u8> = spec
        .payload
        .chunks(spec.piece_length)
        .flat_map(|chunk| sha1(chunk))
        .collect();

    let raw_files = (!spec.files.is_empty()).then(|| {
        spec.files
            .iter()
            .map(|(name, length)| RawFile {
                length: *length as u64,
                md5sum: None,
                path: vec![Cow::Borrowed(*name)],
            })
            .collect::<Vec<_>>()
    });

    let info = RawInfo {
        files: raw_files,
        length: spec.files.is_empty().then_some(spec.payload.len() as u64),
        md5sum: None,
        name: Cow::Borrowed(spec.name),
        piece_length: spec.piece_length as u64,
        pieces: Cow::Owned(pieces),
        private: None,
    };
    let encoded_info = serde_bencode::to_bytes(&info).expect("serializing the info dict failed");

    let mut torrent = Vec::new();
    torrent.extend_from_slice(b"d");
    torrent.extend_from_slice(format!("8:announce{}:{}", spec.announce.len(), spec.announce).as_bytes());
    if !spec.announce_tiers.is_empty() {
        torrent.extend_from_slice(b"13:announce-listl");
        for tier in &spec.announce_tiers {
            torrent.push(b'l');
            for url in tier {
                torrent.extend_from_slice(format!("{}:{}", url.len(), url).as_bytes());
            }
            torrent.push(b'e');
        }
        torrent.push(b'e');
    }
    torrent.extend_from_slice(b"4:info");
    torrent.extend_from_slice(&encoded_info);
    torrent.push(b'e');
    torrent
}

struct SeedConfig {
    payload: Vec<u8>,
    piece_length: usize,
    /// Pieces this seed owns and is willing to serve
    owned: HashSet<u32>,
    /// Pieces served with garbage bytes instead of the real data
    corrupt: HashSet<u32>,
    info_hash: [u8; 20],
}

impl SeedConfig {
    fn piece_count(&self) -> usize {
        self.payload.len().div_ceil(self.piece_length)
    }

    fn wire_bitfield(&self) -> BitVec<u8, Msb0> {
        let mut bitfield = BitVec::<u8, Msb0>::repeat(false, self.piece_count().div_ceil(8) * 8);
        for index in &self.owned {
            bitfield.set(*index as usize, true);
        }
        bitfield
    }
}

/// Spawns a seed that accepts any number of leech connections and serves
/// its configured pieces. Returns the address to dial.
async fn spawn_seed(config: SeedConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("binding the seed failed");
    let addr = listener.local_addr().expect("the seed has no local address");
    let config = Arc::new(config);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_leech(stream, config.clone()));
        }
    });

    addr
}

async fn serve_leech(mut stream: TcpStream, config: Arc<SeedConfig>) {
    let mut handshake_buf = [0u8; Handshake::LENGTH];
    if stream.read_exact(&mut handshake_buf).await.is_err() {
        return;
    }
    let handshake = Handshake::decode(&handshake_buf).expect("the leech sent a malformed handshake");
    assert_eq!(handshake.info_hash, config.info_hash, "info hash mismatch at the seed");

    let mut out = Vec::new();
    Handshake::new(config.info_hash, *b"-SEED00-000000000000")
        .encode(&mut out)
        .await
        .expect("encoding failed");
    Message::Bitfield(config.wire_bitfield())
        .encode(&mut out)
        .await
        .expect("encoding failed");
    if stream.write_all(&out).await.is_err() {
        return;
    }

    let mut decoder = FrameDecoder::new(FrameDecoder::DEFAULT_MAX_FRAME_LEN);
    let mut chunk = [0u8; 8192];

    loop {
        let Ok(received) = stream.read(&mut chunk).await else {
            return;
        };
        if received == 0 {
            return;
        }
        decoder.push(&chunk[..received]);

        let mut out = Vec::new();
        while let Some(message) = decoder.next_message().expect("the leech sent a malformed message") {
            match message {
                Message::Interested => {
                    Message::Unchoke.encode(&mut out).await.expect("encoding failed");
                }
                Message::Request { index, begin, length } => {
                    assert!(
                        config.owned.contains(&index),
                        "the leech requested piece {index} which this seed does not have"
                    );

                    let start = index as usize * config.piece_length + begin as usize;
                    let block = if config.corrupt.contains(&index) {
                        vec![0xaa; length as usize]
                    } else {
                        config.payload[start..start + length as usize].to_vec()
                    };

                    Message::Piece {
                        index,
                        begin,
                        block: Bytes::from(block),
                    }
                    .encode(&mut out)
                    .await
                    .expect("encoding failed");
                }
                Message::NotInterested
                | Message::KeepAlive
                | Message::Cancel { .. }
                | Message::Have(_)
                | Message::Choke
                | Message::Unchoke
                | Message::Bitfield(_)
                | Message::Piece { .. } => {}
            }
        }

        if !out.is_empty() && stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// A BEP-15 tracker that answers every connect and announce with the same
/// peer list, forever
async fn spawn_udp_tracker(peers: Vec<SocketAddr>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("binding the tracker failed");
    let addr = socket.local_addr().expect("the tracker has no local address");

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((received, from)) = socket.recv_from(&mut buf).await else {
                return;
            };

            let mut response = Vec::new();
            if received == 16 {
                // connect: echo the transaction id, grant a connection id
                response.extend_from_slice(&0u32.to_be_bytes());
                response.extend_from_slice(&buf[12..16]);
                response.extend_from_slice(&0xfeed_f00d_u64.to_be_bytes());
            } else if received == 98 {
                // announce: interval, counts, then the peer list
                response.extend_from_slice(&1u32.to_be_bytes());
                response.extend_from_slice(&buf[12..16]);
                response.extend_from_slice(&1800u32.to_be_bytes());
                response.extend_from_slice(&0u32.to_be_bytes());
                response.extend_from_slice(&(peers.len() as u32).to_be_bytes());
                for peer in &peers {
                    let SocketAddr::V4(v4) = peer else {
                        panic!("the mock tracker only serves IPv4 peers");
                    };
                    response.extend_from_slice(&v4.ip().octets());
                    response.extend_from_slice(&v4.port().to_be_bytes());
                }
            } else {
                continue;
            }

            let _ = socket.send_to(&response, from).await;
        }
    });

    addr
}

fn info_hash_of(torrent: &[u8]) -> [u8; 20] {
    riptide::metainfo::Metainfo::from_bytes(torrent)
        .expect("parsing the test torrent failed")
        .info_hash
}

async fn write_torrent(dir: &Path, torrent: &[u8]) -> std::path::PathBuf {
    let path = dir.join("payload.torrent");
    tokio::fs::write(&path, torrent).await.expect("writing the torrent failed");
    path
}

/// An announce URL that refuses connections immediately
const DEAD_HTTP_TRACKER: &str = "http://127.0.0.1:1/announce";

#[tokio::test]
async fn downloads_a_multi_file_payload_from_a_single_seed() {
    let payload = deterministic_payload(65_536);
    let torrent = build_torrent(&TorrentSpec {
        name: "bundle",
        piece_length: 32_768,
        payload: &payload,
        files: vec![("a.bin", 40_000), ("b.bin", 25_536)],
        announce: DEAD_HTTP_TRACKER,
        announce_tiers: vec![],
    });
    let info_hash = info_hash_of(&torrent);

    let seed = spawn_seed(SeedConfig {
        payload: payload.clone(),
        piece_length: 32_768,
        owned: (0..2).collect(),
        corrupt: HashSet::new(),
        info_hash,
    })
    .await;

    let dir = tempfile::tempdir().expect("creating a temp dir failed");
    let torrent_path = write_torrent(dir.path(), &torrent).await;

    let result = tokio::time::timeout(
        TEST_DEADLINE,
        riptide::download(ClientOptions {
            torrent: torrent_path,
            output_dir: dir.path().join("out"),
            port: Some(0),
            max_peers: 4,
            extra_peers: vec![seed],
        }),
    )
    .await
    .expect("the download did not finish in time");
    result.expect("the download failed");

    // a piece straddles the file boundary; both files must read back intact
    let a = std::fs::read(dir.path().join("out/bundle/a.bin")).expect("reading a.bin failed");
    let b = std::fs::read(dir.path().join("out/bundle/b.bin")).expect("reading b.bin failed");
    assert_eq!(a, &payload[..40_000]);
    assert_eq!(b, &payload[40_000..]);
}

#[tokio::test]
async fn disjoint_seeds_cover_the_whole_payload() {
    let payload = deterministic_payload(131_072);
    let torrent = build_torrent(&TorrentSpec {
        name: "halves.bin",
        piece_length: 32_768,
        payload: &payload,
        files: vec![],
        announce: DEAD_HTTP_TRACKER,
        announce_tiers: vec![],
    });
    let info_hash = info_hash_of(&torrent);

    // each seed refuses (asserts on) requests for the other's half
    let first = spawn_seed(SeedConfig {
        payload: payload.clone(),
        piece_length: 32_768,
        owned: (0..2).collect(),
        corrupt: HashSet::new(),
        info_hash,
    })
    .await;
    let second = spawn_seed(SeedConfig {
        payload: payload.clone(),
        piece_length: 32_768,
        owned: (2..4).collect(),
        corrupt: HashSet::new(),
        info_hash,
    })
    .await;

    let dir = tempfile::tempdir().expect("creating a temp dir failed");
    let torrent_path = write_torrent(dir.path(), &torrent).await;

    let result = tokio::time::timeout(
        TEST_DEADLINE,
        riptide::download(ClientOptions {
            torrent: torrent_path,
            output_dir: dir.path().join("out"),
            port: Some(0),
            max_peers: 4,
            extra_peers: vec![first, second],
        }),
    )
    .await
    .expect("the download did not finish in time");
    result.expect("the download failed");

    let written = std::fs::read(dir.path().join("out/halves.bin")).expect("reading the payload failed");
    assert_eq!(written, payload);
}

#[tokio::test]
async fn aborts_after_repeated_hash_failures_from_the_only_peer() {
    let payload = deterministic_payload(65_536);
    let torrent = build_torrent(&TorrentSpec {
        name: "poisoned.bin",
        piece_length: 32_768,
        payload: &payload,
        files: vec![],
        announce: DEAD_HTTP_TRACKER,
        announce_tiers: vec![],
    });
    let info_hash = info_hash_of(&torrent);

    // every block of piece 0 is garbage, every time
    let seed = spawn_seed(SeedConfig {
        payload: payload.clone(),
        piece_length: 32_768,
        owned: (0..2).collect(),
        corrupt: [0].into_iter().collect(),
        info_hash,
    })
    .await;

    let dir = tempfile::tempdir().expect("creating a temp dir failed");
    let torrent_path = write_torrent(dir.path(), &torrent).await;

    let result = tokio::time::timeout(
        TEST_DEADLINE,
        riptide::download(ClientOptions {
            torrent: torrent_path,
            output_dir: dir.path().join("out"),
            port: Some(0),
            max_peers: 2,
            extra_peers: vec![seed],
        }),
    )
    .await
    .expect("the download did not finish in time");

    let error = result.expect_err("a poisoned piece must abort the download");
    assert!(matches!(error, Error::PieceUnrecoverable(0)));
    assert_eq!(error.exit_code(), 3);
}

#[tokio::test]
async fn udp_tracker_discovery_feeds_the_download() {
    let payload = deterministic_payload(65_536);

    let probe = build_torrent(&TorrentSpec {
        name: "discovered.bin",
        piece_length: 32_768,
        payload: &payload,
        files: vec![],
        announce: DEAD_HTTP_TRACKER,
        announce_tiers: vec![],
    });
    let info_hash = info_hash_of(&probe);

    let seed = spawn_seed(SeedConfig {
        payload: payload.clone(),
        piece_length: 32_768,
        owned: (0..2).collect(),
        corrupt: HashSet::new(),
        info_hash,
    })
    .await;
    let tracker = spawn_udp_tracker(vec![seed]).await;

    // dead HTTP tier first; the UDP tier must save the day
    let torrent = build_torrent(&TorrentSpec {
        name: "discovered.bin",
        piece_length: 32_768,
        payload: &payload,
        files: vec![],
        announce: DEAD_HTTP_TRACKER,
        announce_tiers: vec![
            vec![DEAD_HTTP_TRACKER.to_string()],
            vec![format!("udp://127.0.0.1:{}", tracker.port())],
        ],
    });

    let dir = tempfile::tempdir().expect("creating a temp dir failed");
    let torrent_path = write_torrent(dir.path(), &torrent).await;

    let result = tokio::time::timeout(
        TEST_DEADLINE,
        riptide::download(ClientOptions {
            torrent: torrent_path,
            output_dir: dir.path().join("out"),
            port: Some(0),
            max_peers: 4,
            extra_peers: vec![],
        }),
    )
    .await
    .expect("the download did not finish in time");
    result.expect("the download failed");

    let written = std::fs::read(dir.path().join("out/discovered.bin")).expect("reading the payload failed");
    assert_eq!(written, payload);
}

#[tokio::test]
async fn no_discoverable_peers_is_a_distinct_failure() {
    let payload = deterministic_payload(32_768);
    let torrent = build_torrent(&TorrentSpec {
        name: "lonely.bin",
        piece_length: 32_768,
        payload: &payload,
        files: vec![],
        announce: DEAD_HTTP_TRACKER,
        announce_tiers: vec![],
    });

    let dir = tempfile::tempdir().expect("creating a temp dir failed");
    let torrent_path = write_torrent(dir.path(), &torrent).await;

    let result = tokio::time::timeout(
        TEST_DEADLINE,
        riptide::download(ClientOptions {
            torrent: torrent_path,
            output_dir: dir.path().join("out"),
            port: Some(0),
            max_peers: 2,
            extra_peers: vec![],
        }),
    )
    .await
    .expect("the failure did not surface in time");

    let error = result.expect_err("no peers must fail the download");
    assert!(matches!(error, Error::NoPeers));
    assert_eq!(error.exit_code(), 2);
}
