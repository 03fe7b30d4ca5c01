#[macro_use]
mod macros;
mod error;
mod frame;
mod messages;

use std::future::Future;

pub use error::Error;
pub use frame::FrameDecoder;
pub use messages::{Block, BlockRequest, Handshake, Message, MessageId};
use tokio::io::AsyncWriteExt;

pub type Result<T> = std::result::Result<T, Error>;

/// Size of a transfer block. Peers exchanging larger blocks are out of spec.
pub const BLOCK_LENGTH: u32 = 16_384;

pub trait Encode {
    fn encode<T>(&self, dst: &mut T) -> impl Future<Output = Result<()>>
    where
        T: AsyncWriteExt + Unpin;
}

pub trait Decode<'a> {
    fn decode(src: &'a [u8]) -> Result<Self>
    where
        Self: Sized;
}
