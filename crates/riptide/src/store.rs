use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use bittorrent_wire::{Block, BlockRequest};
use sha1::{Digest, Sha1};

use crate::metainfo::{FileEntry, Metainfo};
use crate::piece::{BlockWriteError, Piece, WriteOutcome};
use crate::storage::{file_slices, FileStorage};

pub fn calculate_piece_hash(piece: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();

    hasher.update(piece);

    hasher.finalize().into()
}

#[derive(Debug)]
pub enum CommitOutcome {
    /// The piece hash matched and the bytes are on disk
    Committed { bytes: usize },
    /// The piece hash did not match. Every block went back to `Free`;
    /// `contributors` lists the peers that supplied blocks for scoring.
    HashMismatch {
        retries: u32,
        contributors: Vec<SocketAddr>,
    },
}

/// Owns the piece array and the output files.
///
/// All mutation goes through the scheduler task, so the store itself needs
/// no locking; only the file backend is shared with the blocking pool
/// during commits.
pub struct PieceStore {
    pieces: Vec<Piece>,
    files: Vec<FileEntry>,
    piece_length: u64,
    storage: Arc<Mutex<FileStorage>>,
    remaining: usize,
}

impl PieceStore {
    pub fn new(metainfo: &Metainfo, output_dir: &Path) -> anyhow::Result<Self> {
        let storage = FileStorage::create(output_dir, &metainfo.files)
            .context("error while creating the output file backend")?;

        let pieces = metainfo
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(index, &hash)| {
                let index = index as u32;
                Piece::new(index, metainfo.piece_size(index) as u32, hash)
            })
            .collect::<Vec<_>>();

        let remaining = pieces.len();

        Ok(PieceStore {
            pieces,
            files: metainfo.files.clone(),
            piece_length: metainfo.piece_length,
            storage: Arc::new(Mutex::new(storage)),
            remaining,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, index: u32) -> Option<&Piece> {
        self.pieces.get(index as usize)
    }

    pub fn piece_mut(&mut self, index: u32) -> Option<&mut Piece> {
        self.pieces.get_mut(index as usize)
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Pieces not yet committed
    pub fn remaining_pieces(&self) -> usize {
        self.remaining
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Bitfield of committed pieces, spare bits zero, ready for the wire
    pub fn committed_bitfield(&self) -> BitVec<u8, Msb0> {
        let mut bitfield = BitVec::<u8, Msb0>::repeat(false, self.pieces.len().div_ceil(8) * 8);
        for piece in &self.pieces {
            if piece.state() == crate::piece::PieceState::Committed {
                bitfield.set(piece.index as usize, true);
            }
        }
        bitfield
    }

    pub fn write_block(&mut self, from: SocketAddr, block: &Block) -> Result<WriteOutcome, BlockWriteError> {
        let piece_count = self.pieces.len();
        let piece = self
            .pieces
            .get_mut(block.index as usize)
            .ok_or(BlockWriteError::PieceOutOfRange(block.index, piece_count))?;

        piece.write_block(block.begin, &block.block, from)
    }

    /// Reverts every in-flight block assigned to a disconnected peer
    pub fn release_peer(&mut self, peer: SocketAddr) -> Vec<BlockRequest> {
        self.pieces
            .iter_mut()
            .flat_map(|piece| piece.release_peer(peer))
            .collect()
    }

    /// Hashes a fully received piece and, on a match, writes it to disk.
    ///
    /// Hashing and the positional writes both run on the blocking pool. The
    /// piece buffer is gone afterwards either way: committed pieces live on
    /// disk, failed ones are re-downloaded from scratch.
    pub async fn verify_and_commit(&mut self, index: u32) -> anyhow::Result<CommitOutcome> {
        let piece_length = self.piece_length;
        let files = self.files.clone();
        let storage = self.storage.clone();

        let piece = self
            .pieces
            .get_mut(index as usize)
            .context("bug: committing an out-of-range piece?")?;

        let buffer = piece
            .take_buffer_for_verification()
            .context("bug: committing a piece with missing blocks?")?;
        let expected_hash = piece.expected_hash();

        let matched = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            if calculate_piece_hash(&buffer) != expected_hash {
                return Ok(false);
            }

            let global_offset = index as u64 * piece_length;
            let mut storage = storage
                .lock()
                .map_err(|_| anyhow::anyhow!("output file backend lock was poisoned"))?;

            let mut cursor = 0usize;
            for slice in file_slices(&files, global_offset, buffer.len() as u64) {
                let end = cursor + slice.length as usize;
                storage
                    .write_all(slice.file_idx, slice.offset, &buffer[cursor..end])
                    .with_context(|| {
                        format!(
                            "error while writing piece {} to file index {}",
                            index, slice.file_idx
                        )
                    })?;
                cursor = end;
            }

            Ok(true)
        })
        .await
        .context("bug: the piece commit task panicked?")??;

        let bytes = piece.length() as usize;

        if matched {
            piece.mark_committed();
            self.remaining -= 1;

            Ok(CommitOutcome::Committed { bytes })
        } else {
            let contributors = piece.fail_and_reset();

            Ok(CommitOutcome::HashMismatch {
                retries: piece.retries(),
                contributors,
            })
        }
    }

    /// Flushes the output files. Called once after the last commit.
    pub async fn sync(&self) -> anyhow::Result<()> {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || {
            storage
                .lock()
                .map_err(|_| anyhow::anyhow!("output file backend lock was poisoned"))?
                .sync_all()
        })
        .await
        .context("bug: the sync task panicked?")?
    }

    #[cfg(test)]
    pub(crate) fn read_back(&self, index: u32) -> anyhow::Result<Vec<u8>> {
        let piece = self.piece(index).context("piece out of range")?;
        let mut buffer = vec![0; piece.length() as usize];

        let global_offset = index as u64 * self.piece_length;
        let mut storage = self
            .storage
            .lock()
            .map_err(|_| anyhow::anyhow!("output file backend lock was poisoned"))?;

        let mut cursor = 0usize;
        for slice in file_slices(&self.files, global_offset, buffer.len() as u64) {
            let end = cursor + slice.length as usize;
            storage.read_exact(slice.file_idx, slice.offset, &mut buffer[cursor..end])?;
            cursor = end;
        }

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::FileEntry;
    use bittorrent_wire::BLOCK_LENGTH;
    use bytes::Bytes;
    use std::path::PathBuf;

    fn peer(port: u16) -> SocketAddr {
        format!("10.0.0.2:{port}").parse().expect("valid address")
    }

    /// Two files of 40 and 24 bytes, pieces of 32: piece 1 straddles the
    /// file boundary
    fn test_metainfo() -> Metainfo {
        let files = vec![
            FileEntry {
                path: PathBuf::from("bundle/a.bin"),
                offset: 0,
                length: 40,
            },
            FileEntry {
                path: PathBuf::from("bundle/b.bin"),
                offset: 40,
                length: 24,
            },
        ];

        let payload = test_payload();
        let piece_hashes = payload.chunks(32).map(calculate_piece_hash).collect();

        Metainfo {
            name: "bundle".to_string(),
            info_hash: [3; 20],
            piece_length: 32,
            piece_hashes,
            total_length: 64,
            files,
            announce_tiers: vec![],
            multi_file: true,
        }
    }

    fn test_payload() -> Vec<u8> {
        (0..64u8).collect()
    }

    #[tokio::test]
    async fn commit_writes_across_file_boundaries_and_reads_back() {
        let dir = tempfile::tempdir().expect("creating a temp dir failed");
        let metainfo = test_metainfo();
        let mut store = PieceStore::new(&metainfo, dir.path()).expect("creating the store failed");

        let payload = test_payload();

        for index in 0..2u32 {
            let chunk = &payload[index as usize * 32..index as usize * 32 + 32];
            let outcome = store
                .write_block(
                    peer(1),
                    &Block {
                        index,
                        begin: 0,
                        block: Bytes::copy_from_slice(chunk),
                    },
                )
                .expect("writing failed");
            assert_eq!(
                outcome,
                WriteOutcome::Accepted {
                    piece_complete: true,
                    duplicates: vec![]
                }
            );

            let commit = store.verify_and_commit(index).await.expect("commit failed");
            assert!(matches!(commit, CommitOutcome::Committed { bytes: 32 }));
        }

        assert_eq!(store.remaining_pieces(), 0);
        assert!(store.is_complete());

        // the payload must survive the disk round-trip, boundary included
        assert_eq!(store.read_back(0).expect("read back failed"), &payload[..32]);
        assert_eq!(store.read_back(1).expect("read back failed"), &payload[32..]);

        let bitfield = store.committed_bitfield();
        assert!(bitfield[0] && bitfield[1]);
    }

    #[tokio::test]
    async fn hash_mismatch_resets_the_piece_and_reports_contributors() {
        let dir = tempfile::tempdir().expect("creating a temp dir failed");
        let metainfo = test_metainfo();
        let mut store = PieceStore::new(&metainfo, dir.path()).expect("creating the store failed");

        store
            .write_block(
                peer(9),
                &Block {
                    index: 0,
                    begin: 0,
                    block: Bytes::from_static(&[0xff; 32]),
                },
            )
            .expect("writing failed");

        let outcome = store.verify_and_commit(0).await.expect("commit failed");
        let CommitOutcome::HashMismatch { retries, contributors } = outcome else {
            panic!("corrupt piece was committed");
        };
        assert_eq!(retries, 1);
        assert_eq!(contributors, vec![peer(9)]);

        assert_eq!(store.remaining_pieces(), 2);
        let piece = store.piece(0).expect("piece exists");
        assert_eq!(piece.state(), crate::piece::PieceState::Pending);
        assert_eq!(piece.next_free_block(), Some(0));
    }

    #[test]
    fn out_of_range_piece_index_is_rejected() {
        let dir = tempfile::tempdir().expect("creating a temp dir failed");
        let metainfo = test_metainfo();
        let mut store = PieceStore::new(&metainfo, dir.path()).expect("creating the store failed");

        let result = store.write_block(
            peer(1),
            &Block {
                index: 2,
                begin: 0,
                block: Bytes::from_static(&[0; 32]),
            },
        );
        assert_eq!(result, Err(BlockWriteError::PieceOutOfRange(2, 2)));
    }

    #[test]
    fn single_piece_payload_smaller_than_block_length() {
        let dir = tempfile::tempdir().expect("creating a temp dir failed");
        let payload = vec![7u8; 100];
        let metainfo = Metainfo {
            name: "tiny.bin".to_string(),
            info_hash: [1; 20],
            piece_length: BLOCK_LENGTH as u64 * 4,
            piece_hashes: vec![calculate_piece_hash(&payload)],
            total_length: 100,
            files: vec![FileEntry {
                path: PathBuf::from("tiny.bin"),
                offset: 0,
                length: 100,
            }],
            announce_tiers: vec![],
            multi_file: false,
        };

        let store = PieceStore::new(&metainfo, dir.path()).expect("creating the store failed");
        assert_eq!(store.piece_count(), 1);
        let piece = store.piece(0).expect("piece exists");
        assert_eq!(piece.block_count(), 1);
        assert_eq!(piece.block_length(0), 100);
    }
}
