use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in a session or a transfer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("timed out after {:?} waiting for {what}", .after)]
    Timeout { what: String, after: Duration },

    #[error("malformed envelope: {0}")]
    Decode(String),

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("transfer handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("no handshake reply within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("chunk {chunk_id} failed after {attempts} attempts")]
    ChunkTransferFailed { chunk_id: u64, attempts: u32 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("{limit} transfers already active")]
    TooManyConcurrentTransfers { limit: usize },

    #[error("transport closed")]
    TransportClosed,

    #[error("peer replied with error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Stable, serializable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    DecodeError,
    MessageTooLarge,
    HandshakeRejected,
    HandshakeTimeout,
    ChunkTransferFailed,
    ChecksumMismatch,
    Cancelled,
    TooManyConcurrentTransfers,
    TransportClosed,
    Remote,
    Protocol,
    InvalidTransition,
    InvalidConfig,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Decode(_) => ErrorKind::DecodeError,
            Error::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            Error::HandshakeRejected(_) => ErrorKind::HandshakeRejected,
            Error::HandshakeTimeout(_) => ErrorKind::HandshakeTimeout,
            Error::ChunkTransferFailed { .. } => ErrorKind::ChunkTransferFailed,
            Error::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::TooManyConcurrentTransfers { .. } => ErrorKind::TooManyConcurrentTransfers,
            Error::TransportClosed => ErrorKind::TransportClosed,
            Error::Remote { .. } => ErrorKind::Remote,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Closed pipes and resets all mean the peer is gone.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Error::TransportClosed,
            _ => Error::Io(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::MessageTooLarge => "message_too_large",
            ErrorKind::HandshakeRejected => "handshake_rejected",
            ErrorKind::HandshakeTimeout => "handshake_timeout",
            ErrorKind::ChunkTransferFailed => "chunk_transfer_failed",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TooManyConcurrentTransfers => "too_many_concurrent_transfers",
            ErrorKind::TransportClosed => "transport_closed",
            ErrorKind::Remote => "remote",
            ErrorKind::Protocol => "protocol",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::Io => "io",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_maps_to_transport_closed() {
        let err = Error::from_io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert_eq!(err.kind(), ErrorKind::TransportClosed);

        let err = Error::from_io(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ChecksumMismatch).unwrap();
        assert_eq!(json, "\"checksum_mismatch\"");
        assert_eq!(ErrorKind::ChecksumMismatch.to_string(), "checksum_mismatch");
    }
}
