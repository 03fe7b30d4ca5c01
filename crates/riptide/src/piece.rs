use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bittorrent_wire::{BlockRequest, BLOCK_LENGTH};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BlockWriteError {
    #[error("piece index {0} is out of range ({1} pieces)")]
    PieceOutOfRange(u32, usize),
    #[error("block offset {0} is not aligned to the block length")]
    MisalignedOffset(u32),
    #[error("block at offset {0} with length {1} exceeds the piece length {2}")]
    OutOfRange(u32, usize, u32),
    #[error("block at offset {0} has length {1}, expected {2}")]
    WrongLength(u32, usize, u32),
}

/// An in-flight request. Outside the endgame a block carries exactly one of
/// these; during the endgame the same block may be requested from several
/// peers at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub peer: SocketAddr,
    pub since: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    Free,
    InFlight(Vec<Assignment>),
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Pending,
    Downloading,
    Verifying,
    Committed,
    Failed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The block was written into the piece buffer. `duplicates` lists the
    /// other peers the same block is still requested from (endgame), so the
    /// caller can cancel them.
    Accepted {
        piece_complete: bool,
        duplicates: Vec<SocketAddr>,
    },
    /// The block had already arrived from another peer, or the piece is past
    /// the downloading stage. Discarded silently.
    Discarded,
}

/// One piece of the payload and the per-block download bookkeeping.
///
/// The buffer is allocated on the first accepted block and released on
/// commit or reset, so memory usage is bounded by the number of pieces
/// actually in flight.
#[derive(Debug)]
pub struct Piece {
    pub index: u32,
    length: u32,
    expected_hash: [u8; 20],
    state: PieceState,
    blocks: Vec<BlockState>,
    buffer: Option<Vec<u8>>,
    retries: u32,
    contributors: HashSet<SocketAddr>,
}

impl Piece {
    pub fn new(index: u32, length: u32, expected_hash: [u8; 20]) -> Self {
        let block_count = length.div_ceil(BLOCK_LENGTH) as usize;

        Piece {
            index,
            length,
            expected_hash,
            state: PieceState::Pending,
            blocks: vec![BlockState::Free; block_count],
            buffer: None,
            retries: 0,
            contributors: HashSet::new(),
        }
    }

    pub fn state(&self) -> PieceState {
        self.state
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn expected_hash(&self) -> [u8; 20] {
        self.expected_hash
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Only the final block of a piece may be shorter than [`BLOCK_LENGTH`]
    pub fn block_length(&self, block_idx: usize) -> u32 {
        if block_idx == self.blocks.len() - 1 {
            let remainder = self.length % BLOCK_LENGTH;
            if remainder == 0 {
                BLOCK_LENGTH
            } else {
                remainder
            }
        } else {
            BLOCK_LENGTH
        }
    }

    pub fn block_request(&self, block_idx: usize) -> BlockRequest {
        BlockRequest::new(
            self.index,
            block_idx as u32 * BLOCK_LENGTH,
            self.block_length(block_idx),
        )
    }

    /// Whether this piece still has work a scheduler could hand out
    pub fn is_downloadable(&self) -> bool {
        matches!(self.state, PieceState::Pending | PieceState::Downloading)
    }

    /// Lowest-offset free block, if any
    pub fn next_free_block(&self) -> Option<usize> {
        self.blocks
            .iter()
            .position(|block| matches!(block, BlockState::Free))
    }

    /// Records an in-flight request for a block. A block that is already in
    /// flight gains an additional assignment (endgame duplication).
    pub fn assign(&mut self, block_idx: usize, peer: SocketAddr, now: Instant) -> BlockRequest {
        let assignment = Assignment { peer, since: now };

        match &mut self.blocks[block_idx] {
            state @ BlockState::Free => *state = BlockState::InFlight(vec![assignment]),
            BlockState::InFlight(assignments) => assignments.push(assignment),
            BlockState::Received => unreachable!("bug: assigning an already received block?"),
        }

        if self.state == PieceState::Pending {
            self.state = PieceState::Downloading;
        }

        self.block_request(block_idx)
    }

    /// In-flight blocks together with the peers they are assigned to.
    /// The endgame duplicates requests from this list.
    pub fn in_flight(&self) -> impl Iterator<Item = (BlockRequest, &[Assignment])> {
        self.blocks.iter().enumerate().filter_map(|(block_idx, block)| {
            if let BlockState::InFlight(assignments) = block {
                Some((self.block_request(block_idx), assignments.as_slice()))
            } else {
                None
            }
        })
    }

    pub fn write_block(
        &mut self,
        begin: u32,
        data: &[u8],
        from: SocketAddr,
    ) -> Result<WriteOutcome, BlockWriteError> {
        if begin % BLOCK_LENGTH != 0 {
            return Err(BlockWriteError::MisalignedOffset(begin));
        }
        let block_idx = (begin / BLOCK_LENGTH) as usize;
        if block_idx >= self.blocks.len() || begin as usize + data.len() > self.length as usize {
            return Err(BlockWriteError::OutOfRange(begin, data.len(), self.length));
        }
        let expected_len = self.block_length(block_idx);
        if data.len() != expected_len as usize {
            return Err(BlockWriteError::WrongLength(begin, data.len(), expected_len));
        }

        // Late endgame stragglers for a piece already being verified or
        // committed are valid but no longer needed
        if !matches!(self.state, PieceState::Pending | PieceState::Downloading) {
            return Ok(WriteOutcome::Discarded);
        }

        let duplicates = match std::mem::replace(&mut self.blocks[block_idx], BlockState::Received) {
            BlockState::Received => {
                self.blocks[block_idx] = BlockState::Received;
                return Ok(WriteOutcome::Discarded);
            }
            BlockState::Free => Vec::new(),
            BlockState::InFlight(assignments) => assignments
                .into_iter()
                .map(|assignment| assignment.peer)
                .filter(|peer| *peer != from)
                .collect(),
        };

        let buffer = self
            .buffer
            .get_or_insert_with(|| vec![0; self.length as usize]);
        buffer[begin as usize..begin as usize + data.len()].copy_from_slice(data);

        self.contributors.insert(from);

        Ok(WriteOutcome::Accepted {
            piece_complete: self.all_received(),
            duplicates,
        })
    }

    pub fn all_received(&self) -> bool {
        self.blocks
            .iter()
            .all(|block| matches!(block, BlockState::Received))
    }

    /// Moves the piece into `Verifying` and hands the buffer to the caller
    pub fn take_buffer_for_verification(&mut self) -> Option<Vec<u8>> {
        if !self.all_received() {
            return None;
        }

        self.state = PieceState::Verifying;
        self.buffer.take()
    }

    pub fn mark_committed(&mut self) {
        self.state = PieceState::Committed;
        self.buffer = None;
        self.contributors.clear();
    }

    /// Hash mismatch: every block returns to `Free`, the buffer is dropped,
    /// and the set of peers that contributed is drained for scoring.
    pub fn fail_and_reset(&mut self) -> Vec<SocketAddr> {
        self.state = PieceState::Failed;
        for block in &mut self.blocks {
            *block = BlockState::Free;
        }
        self.buffer = None;
        self.retries += 1;

        let contributors = self.contributors.drain().collect();

        self.state = PieceState::Pending;
        contributors
    }

    /// Removes one peer's assignment from a block. The block reverts to
    /// `Free` when no other assignment remains. Returns `true` if the peer
    /// was actually assigned.
    pub fn release_assignment(&mut self, begin: u32, peer: SocketAddr) -> bool {
        let block_idx = (begin / BLOCK_LENGTH) as usize;
        let Some(BlockState::InFlight(assignments)) = self.blocks.get_mut(block_idx) else {
            return false;
        };

        let before = assignments.len();
        assignments.retain(|assignment| assignment.peer != peer);
        let released = assignments.len() < before;

        if assignments.is_empty() {
            self.blocks[block_idx] = BlockState::Free;
        }

        released
    }

    /// Reverts every in-flight assignment held by a disconnected peer
    pub fn release_peer(&mut self, peer: SocketAddr) -> Vec<BlockRequest> {
        let mut released = Vec::new();
        for block_idx in 0..self.blocks.len() {
            let request = self.block_request(block_idx);
            if self.release_assignment(request.begin, peer) {
                released.push(request);
            }
        }

        released
    }

    /// Assignments that have been in flight longer than `timeout`
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> Vec<(BlockRequest, SocketAddr)> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(block_idx, block)| {
                if let BlockState::InFlight(assignments) = block {
                    Some((block_idx, assignments))
                } else {
                    None
                }
            })
            .flat_map(|(block_idx, assignments)| {
                let request = self.block_request(block_idx);
                assignments
                    .iter()
                    .filter(move |assignment| now.duration_since(assignment.since) >= timeout)
                    .map(move |assignment| (request, assignment.peer))
            })
            .collect()
    }
}
