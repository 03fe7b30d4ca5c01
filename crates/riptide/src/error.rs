use std::fmt::Debug;
use std::result;

use thiserror::Error;

pub type Result<T> = result::Result<T, Error>;

#[derive(Error)]
pub enum Error {
    #[error("error while parsing the torrent file: {0}")]
    ParsingError(#[from] serde_bencode::error::Error),
    #[error("invalid torrent file: {0}")]
    InvalidMetainfo(&'static str),
    #[error("no peers could be discovered from any tracker")]
    NoPeers,
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("piece {0} failed verification too many times, aborting")]
    PieceUnrecoverable(u32),
    #[error("download was cancelled")]
    Cancelled,
    #[error("an error happened: {0}")]
    InternalError(&'static str),
}

impl Error {
    /// Process exit code for this error kind
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ParsingError(_) | Error::InvalidMetainfo(_) => 1,
            Error::NoPeers => 2,
            Error::IoError(_) | Error::PieceUnrecoverable(_) | Error::InternalError(_) => 3,
            Error::Cancelled => 4,
        }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)?;
        Ok(())
    }
}
