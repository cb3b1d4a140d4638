//! Error types for orientation sources and the log codec

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while decoding an orientation log
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Not enough bytes for a fixed-size header or record
    #[error("Record too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// File does not start with the log magic
    #[error("Invalid orientation log: bad magic bytes")]
    BadMagic,

    /// Log written by a newer format revision
    #[error("Unsupported orientation log version: {0}")]
    UnsupportedVersion(u16),

    /// Record payload does not match its checksum
    #[error("Checksum mismatch: record says {expected:#010x}, payload hashes to {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Record offset went backwards
    #[error("Record out of order: offset {offset}ms follows {previous}ms")]
    OutOfOrder { previous: u32, offset: u32 },
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Storage unavailable at '{}'", path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Orientation log '{}' not found: {reason}", path.display())]
    FileNotFound { path: PathBuf, reason: String },
    #[error("Corrupt record: {0}")]
    CorruptRecord(#[from] CodecError),
    #[error("Hardware feed unavailable: {0}")]
    HardwareUnavailable(String),
    #[error("Invalid log identifier '{0}'")]
    InvalidLogId(String),
    #[error("Orientation log '{0}' already exists")]
    LogExists(String),
    #[error("No replay file selected")]
    NoReplayFile,
    #[error("I/O operation failed")]
    Io(#[from] io::Error),
}

impl SourceError {
    pub(crate) fn not_found(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SourceError::FileNotFound {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SourceError::StorageUnavailable {
            path: path.into(),
            source,
        }
    }
}
