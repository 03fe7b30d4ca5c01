mod handshake;
mod wire;

pub use handshake::Handshake;
pub use wire::{Message, MessageId};

use bytes::Bytes;

/// A single block of payload data received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub block: Bytes,
}

/// Identifies one block inside a piece. Used for both `request` and `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        BlockRequest { index, begin, length }
    }
}
