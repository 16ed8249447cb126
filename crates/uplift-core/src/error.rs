//! Error types for Uplift core

use std::path::PathBuf;
use thiserror::Error;

/// Errors that end a batch or a patch run
#[derive(Debug, Error)]
pub enum UpliftError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Patch archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl UpliftError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            UpliftError::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Errors raised by a single transport while probing or fetching a resource
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Swarm error: {0}")]
    Swarm(String),

    #[error("Transfer aborted")]
    Aborted,
}

impl TransportError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(e) => e.is_timeout() || e.is_connect(),
            TransportError::Status { status, .. } => *status >= 500,
            TransportError::Swarm(_) => true,
            _ => false,
        }
    }
}

/// Errors from decoding or applying a binary delta
#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a delta file (bad magic)")]
    BadMagic,

    #[error("Delta file is truncated")]
    Truncated,

    #[error("Delta expects a {expected} byte base file, found {actual} bytes")]
    BaseMismatch { expected: u64, actual: u64 },

    #[error("Unknown delta op {0:#04x}")]
    UnknownOp(u8),

    #[error("Copy of {len} bytes at {offset} exceeds old file of {old_len} bytes")]
    CopyOutOfRange { offset: u64, len: u64, old_len: u64 },

    #[error("Delta output is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("Delta output checksum mismatch")]
    ChecksumMismatch,

    #[error("Delta application aborted")]
    Aborted,
}

/// Errors confined to one patch archive entry; the run continues past them
#[derive(Debug, Error)]
pub enum EntryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Could not move {path} aside: {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Delta error: {0}")]
    Delta(#[from] DeltaError),

    #[error("Entry path escapes the application directory: {0}")]
    UnsafePath(String),

    #[error("Entry was interrupted by cancellation")]
    Cancelled,
}

// Allow converting to String for outcome reporting
impl From<UpliftError> for String {
    fn from(error: UpliftError) -> Self {
        error.to_string()
    }
}
