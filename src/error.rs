//! # Error Types
//!
//! Error handling for the transfer protocol engine.
//!
//! Every fallible operation in the crate returns [`ProtocolError`]. The variants
//! are grouped by the scope they tear down:
//!
//! ## Error Categories
//! - **Connection-scoped**: `ConnectionFailed`, `MalformedFrame`, `ConnectionClosed`.
//!   These end the connection and surface as connection status changes.
//! - **Request-scoped**: `Unauthorized`. The request is dropped, the connection stays up.
//! - **Transfer-scoped**: `OutOfOrderSegment`, `ChecksumMismatch`, `LocalIo`, `PeerFailure`.
//!   The affected transfer is marked Failed, other transfers on the connection continue.
//!
//! The enum derives `Serialize`/`Deserialize` so a failure can travel with a
//! persisted transfer record; I/O sources are skipped.
//!
//! ## Example Usage
//! ```rust
//! use filewire::error::{ProtocolError, Result};
//!
//! fn check_index(expected: u32, received: u32) -> Result<()> {
//!     if expected != received {
//!         return Err(ProtocolError::OutOfOrderSegment { expected, received });
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_index(2, 3).is_err());
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use crate::transfer::record::TransferStatus;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_FRAME_TOO_SHORT: &str = "Declared frame length is shorter than the header";
    pub const ERR_FRAME_TRUNCATED: &str = "Frame is truncated";
    pub const ERR_FRAME_TRAILING: &str = "Trailing bytes after frame";
    pub const ERR_BODY_TRUNCATED: &str = "Message body is truncated";
    pub const ERR_BODY_TRAILING: &str = "Message body has trailing bytes";
    pub const ERR_INVALID_UTF8: &str = "String field is not valid UTF-8";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_CONNECTION_TIMEOUT: &str = "Connection timed out (no activity)";
    pub const ERR_CLOSED_LOCALLY: &str = "Connection closed locally";
    pub const ERR_CLOSED_BY_PEER: &str = "Connection closed by peer";
    pub const ERR_MALFORMED_STREAM: &str = "Malformed frame on stream";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Status texts
    pub const STATUS_AUTHENTICATED: &str = "Authenticated";

    /// Transfer errors
    pub const ERR_SOURCE_CHANGED: &str = "Source file changed since the original request";
    pub const ERR_EMPTY_FILE_NAME: &str = "File name is empty";
    pub const ERR_SEGMENT_COUNT: &str = "Segment count does not match file length";
    pub const ERR_DUPLICATE_TRANSFER: &str = "Transfer id already active on this connection";
    pub const ERR_NOT_AUTHENTICATED: &str = "Session has no token";
    pub const ERR_RNG: &str = "Random source unavailable";
}

// ProtocolError is the primary error type for all engine operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Connection to {address} failed after {attempts} attempts")]
    ConnectionFailed { address: String, attempts: u32 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unauthorized: session token missing or mismatched")]
    Unauthorized,

    #[error("Out-of-order segment: expected {expected}, received {received}")]
    OutOfOrderSegment { expected: u32, received: u32 },

    #[error("Checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Local I/O failure: {0}")]
    LocalIo(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Session is not connected")]
    NotConnected,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(u64),

    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("Invalid transfer request: {0}")]
    InvalidRequest(String),

    #[error("Peer reported failure: {0}")]
    PeerFailure(String),

    #[error("Transfer record not found: {0}")]
    RecordNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Wrap a filesystem error as a transfer-scoped local failure.
    pub fn local_io(context: &str, err: io::Error) -> Self {
        ProtocolError::LocalIo(format!("{context}: {err}"))
    }

    /// Whether the error ends the connection rather than a single transfer.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedFrame(_)
                | ProtocolError::ConnectionFailed { .. }
                | ProtocolError::ConnectionClosed
                | ProtocolError::Io(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_fatal_classification() {
        assert!(ProtocolError::MalformedFrame("x".into()).is_connection_fatal());
        assert!(ProtocolError::ConnectionClosed.is_connection_fatal());
        assert!(!ProtocolError::Unauthorized.is_connection_fatal());
        assert!(!ProtocolError::OutOfOrderSegment {
            expected: 1,
            received: 3
        }
        .is_connection_fatal());
    }

    #[test]
    fn test_reason_strings() {
        let err = ProtocolError::ChecksumMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(err.to_string(), "Checksum mismatch: expected aa, computed bb");

        let err = ProtocolError::local_io("open source", io::Error::other("denied"));
        assert!(err.to_string().starts_with("Local I/O failure: open source"));
    }
}
