use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use bytes::{Buf, Bytes};
use std::io::Cursor;
use tokio::io::AsyncWriteExt;

use crate::{Decode, Encode, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have,
    Bitfield,
    Request,
    Piece,
    Cancel,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            other => return Err(Error::UnknownMessageId(other)),
        })
    }
}

/// Peer wire protocol messages.
///
/// Every non-handshake frame is `<4-byte big-endian length><1-byte id><payload>`;
/// a zero length prefix is a keep-alive and carries no id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    /// No requests from the sender will be answered until it unchokes us
    Choke,
    Unchoke,
    /// The sender wants pieces the receiver holds
    Interested,
    NotInterested,
    /// Zero-based index of a piece the sender has downloaded and verified
    Have(u32),
    /// One bit per piece, MSB-first, spare bits zero. Only valid directly
    /// after the handshake.
    Bitfield(BitVec<u8, Msb0>),
    /// Ask for one block: piece index, byte offset inside the piece, length
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    /// A block of payload data
    Piece {
        index: u32,
        begin: u32,
        block: Bytes,
    },
    /// Withdraw an earlier `Request` with an identical payload
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
}

impl Message {
    pub const LENGTH_PREFIX: usize = 4;

    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have(_) => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
        }
    }

    pub fn length_and_message_id(&self) -> (u32, Option<MessageId>) {
        let length = match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have(_) => 5,
            Message::Bitfield(bitvec) => 1 + bitvec.as_raw_slice().len(),
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len(),
        };

        // Both bitfield and piece payloads are bounded far below u32::MAX
        (
            u32::try_from(length).expect("wire message length should fit in a u32"),
            self.message_id(),
        )
    }
}

impl Encode for Message {
    async fn encode<T>(&self, dst: &mut T) -> Result<()>
    where
        T: AsyncWriteExt + Unpin,
    {
        let (length, message_id) = self.length_and_message_id();

        dst.write_all(&length.to_be_bytes()).await?;

        if let Some(message_id) = message_id {
            dst.write_all(&[message_id as u8]).await?;
        }

        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have(piece_idx) => {
                dst.write_all(&piece_idx.to_be_bytes()).await?;
            }
            Message::Bitfield(bitfield) => {
                dst.write_all(bitfield.as_raw_slice()).await?;
            }
            Message::Request { index, begin, length }
            | Message::Cancel { index, begin, length } => {
                dst.write_all(&index.to_be_bytes()).await?;
                dst.write_all(&begin.to_be_bytes()).await?;
                dst.write_all(&length.to_be_bytes()).await?;
            }
            Message::Piece { index, begin, block } => {
                dst.write_all(&index.to_be_bytes()).await?;
                dst.write_all(&begin.to_be_bytes()).await?;
                dst.write_all(block).await?;
            }
        };

        Ok(())
    }
}

impl<'a> Decode<'a> for Message {
    /// Decodes a single complete frame, length prefix included.
    fn decode(src: &'a [u8]) -> Result<Self> {
        check_length!(src.len(), Self::LENGTH_PREFIX);

        let mut src = Cursor::new(src);

        let length = src.get_u32() as usize;

        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        check_length!(src.remaining(), length);

        let raw_id = src.get_u8();
        let message_id: MessageId = raw_id.try_into()?;
        let payload_len = length - 1;

        let expected = match message_id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => Some(0),
            MessageId::Have => Some(4),
            MessageId::Request | MessageId::Cancel => Some(12),
            // bitfield needs at least one byte, piece at least index + begin
            MessageId::Bitfield => None,
            MessageId::Piece => None,
        };
        match expected {
            Some(expected) if payload_len != expected => {
                return Err(Error::BadPayloadLength(raw_id, payload_len));
            }
            None => {
                let minimum = if message_id == MessageId::Bitfield { 1 } else { 8 };
                if payload_len < minimum {
                    return Err(Error::BadPayloadLength(raw_id, payload_len));
                }
            }
            _ => {}
        }

        Ok(match message_id {
            MessageId::Choke => Self::Choke,
            MessageId::Unchoke => Self::Unchoke,
            MessageId::Interested => Self::Interested,
            MessageId::NotInterested => Self::NotInterested,
            MessageId::Have => Self::Have(src.get_u32()),
            MessageId::Bitfield => {
                let mut raw_bitfield = vec![0; payload_len];
                src.copy_to_slice(&mut raw_bitfield);
                Self::Bitfield(BitVec::from_vec(raw_bitfield))
            }
            MessageId::Request => Self::Request {
                index: src.get_u32(),
                begin: src.get_u32(),
                length: src.get_u32(),
            },
            MessageId::Piece => {
                let index = src.get_u32();
                let begin = src.get_u32();
                let block = src.copy_to_bytes(payload_len - 8);
                Self::Piece { index, begin, block }
            }
            MessageId::Cancel => Self::Cancel {
                index: src.get_u32(),
                begin: src.get_u32(),
                length: src.get_u32(),
            },
        })
    }
}
