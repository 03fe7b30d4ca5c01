use bitvec::order::Msb0;
use bitvec::slice::BitSlice;
use rand::Rng;

use crate::piece::Piece;

/// Rarest-first piece selection.
///
/// Keeps one availability counter per piece, updated incrementally as peer
/// bitfields arrive, `have` messages trickle in, and sessions end. Pure
/// bookkeeping: the scheduler feeds it state and asks for decisions.
#[derive(Debug)]
pub struct Picker {
    rarity: Vec<u32>,
    /// Equal-rarity candidates are drawn from a window of this size to keep
    /// peers in a swarm from converging on the same piece
    tie_window: usize,
}

impl Picker {
    const DEFAULT_TIE_WINDOW: usize = 4;

    pub fn new(piece_count: usize) -> Self {
        Picker {
            rarity: vec![0; piece_count],
            tie_window: Self::DEFAULT_TIE_WINDOW,
        }
    }

    pub fn rarity(&self, index: u32) -> u32 {
        self.rarity[index as usize]
    }

    /// Accounts for a newly arrived full bitfield
    pub fn peer_added(&mut self, bitfield: &BitSlice<u8, Msb0>) {
        for (index, bit) in bitfield.iter().by_vals().enumerate().take(self.rarity.len()) {
            if bit {
                self.rarity[index] += 1;
            }
        }
    }

    /// Undoes [`Picker::peer_added`] when a session ends
    pub fn peer_removed(&mut self, bitfield: &BitSlice<u8, Msb0>) {
        for (index, bit) in bitfield.iter().by_vals().enumerate().take(self.rarity.len()) {
            if bit {
                self.rarity[index] -= 1;
            }
        }
    }

    pub fn peer_has(&mut self, index: u32) {
        self.rarity[index as usize] += 1;
    }

    /// Picks the piece to request next from a peer holding `peer_bitfield`:
    /// the rarest piece that still has free blocks and that the peer can
    /// provide. Ties are broken by lowest index within a small random
    /// window.
    pub fn pick_piece(
        &self,
        pieces: &[Piece],
        peer_bitfield: &BitSlice<u8, Msb0>,
        rng: &mut impl Rng,
    ) -> Option<u32> {
        let mut candidates: Vec<u32> = Vec::new();
        let mut best_rarity = u32::MAX;

        for piece in pieces {
            if !piece.is_downloadable() || piece.next_free_block().is_none() {
                continue;
            }
            let index = piece.index as usize;
            if !peer_bitfield.get(index).as_deref().copied().unwrap_or(false) {
                continue;
            }

            let rarity = self.rarity[index];
            if rarity == 0 {
                continue;
            }

            if rarity < best_rarity {
                best_rarity = rarity;
                candidates.clear();
            }
            if rarity == best_rarity && candidates.len() < self.tie_window {
                candidates.push(piece.index);
            }
        }

        if candidates.is_empty() {
            return None;
        }

        let choice = rng.gen_range(0..candidates.len());
        Some(candidates[choice])
    }
}
