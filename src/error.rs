//! Error taxonomy for the transport core.
//!
//! Every operation returns [`Result`]; OS and library failures are converted
//! at the lowest level into one of these variants so nothing else crosses
//! the public boundary. Nothing is retried here - reconnect/resend policy
//! belongs to the caller.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("connection closed by peer {peer}")]
    ConnectionClosed { peer: String },

    #[error("timed out waiting for peer {peer}")]
    Timeout { peer: String },

    #[error("read limit exceeded: {got} bytes against limit {limit}")]
    ReadLimitExceeded { got: usize, limit: usize },

    #[error("frame decode failed: {reason}")]
    DecodeError { reason: String },

    #[error("checksum mismatch after {bytes} bytes: sender announced {announced}, receiver computed {computed}")]
    ChecksumMismatch {
        announced: String,
        computed: String,
        bytes: u64,
    },

    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("archive error: {reason}")]
    ArchiveError { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Type alias for Results using WireError
pub type Result<T> = std::result::Result<T, WireError>;
