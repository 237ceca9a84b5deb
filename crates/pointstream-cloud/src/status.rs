use crate::{Lod, VoxelKey};

use std::io;
use thiserror::Error;

pub type StatusResult<T> = Result<T, Status>;

/// Every fallible operation in the engine reports one of these.
///
/// `Status` is `Clone` so a single fetch outcome can be handed to every waiter that coalesced onto it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Status {
    /// A data source failed to open, read or write. Retryable.
    #[error("I/O error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },
    /// The bytes could not be decoded. Never retried with the same bytes.
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),
    #[error("data source is not open")]
    NotOpen,
    #[error("operation not supported by this data source: {0}")]
    Unsupported(&'static str),
    #[error("no data source registered for scheme {0:?}")]
    UnknownScheme(String),
    #[error("invalid data source URL {0:?}")]
    InvalidUrl(String),
    #[error("voxel {key:?} has no blob at LOD {lod:?}")]
    MissingBlob { key: VoxelKey, lod: Lod },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Status {
    pub fn io(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self::Io {
            kind,
            message: message.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptPayload(message.into())
    }

    /// Only I/O failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

impl From<io::Error> for Status {
    fn from(e: io::Error) -> Self {
        Self::io(e.kind(), e.to_string())
    }
}

impl From<sled::Error> for Status {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::Io(io) => io.into(),
            corruption @ sled::Error::Corruption { .. } => Self::corrupt(corruption.to_string()),
            other => Self::io(io::ErrorKind::Other, other.to_string()),
        }
    }
}
