use std::fmt::Debug;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("an IO error happened: {0}")]
    IoError(#[from] std::io::Error),
    #[error("expected at least {1} bytes while got {0}")]
    BadLength(usize, usize),
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),
    #[error("frame of {0} bytes exceeds the {1} byte cap")]
    FrameTooLarge(usize, usize),
    #[error("message payload length {1} does not match message id {0}")]
    BadPayloadLength(u8, usize),
    #[error("bad handshake: {0}")]
    BadHandshake(&'static str),
    #[error("an error happened when converting a value: {0}")]
    ConversionError(&'static str),
}
