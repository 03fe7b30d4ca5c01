use bytes::{Buf, BytesMut};

use crate::{Decode, Error, Message, Result, BLOCK_LENGTH};

/// Incremental framer for the peer wire protocol.
///
/// Pure state machine over a byte buffer: feed it raw bytes from a socket
/// with [`FrameDecoder::push`], drain complete messages with
/// [`FrameDecoder::next_message`]. `Ok(None)` means more bytes are needed.
/// Any error is unrecoverable and the caller is expected to drop the
/// connection.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Largest frame a well-behaved leech ever receives: one block plus the
    /// `piece` message header.
    pub const DEFAULT_MAX_FRAME_LEN: usize = BLOCK_LENGTH as usize + 9;

    pub fn new(max_frame_len: usize) -> Self {
        FrameDecoder {
            buf: BytesMut::with_capacity(Self::DEFAULT_MAX_FRAME_LEN.min(max_frame_len) * 2),
            max_frame_len,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a complete frame
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < Message::LENGTH_PREFIX {
            return Ok(None);
        }

        let length = u32::from_be_bytes(
            self.buf[..Message::LENGTH_PREFIX]
                .try_into()
                .expect("4-byte slice"),
        ) as usize;

        if length > self.max_frame_len {
            return Err(Error::FrameTooLarge(length, self.max_frame_len));
        }

        let frame_len = Message::LENGTH_PREFIX + length;
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let message = Message::decode(&self.buf[..frame_len])?;
        self.buf.advance(frame_len);

        Ok(Some(message))
    }
}
