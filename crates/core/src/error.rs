//! Error types for the veridb engine
//!
//! One `Error` enum is shared across all crates. The taxonomy matters to
//! callers: `Conflict` and `Busy` are retryable with backoff, `NotFound` is
//! recoverable, `Corrupted` and `InvalidConfig` are fatal for the affected
//! segment or the whole store respectively.

use crate::types::{Key, TxId};
use std::io;
use thiserror::Error;

/// Result type alias for veridb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Phase of the commit pipeline an error was raised in.
///
/// Used to wrap I/O and encoding errors with enough context for the caller
/// to know whether the transaction could have reached the durability point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    /// Admitted by the coordinator, values not yet written.
    Admitted,
    /// Commit header appended (durability point reached).
    Logged,
    /// Index application in progress.
    Indexed,
}

impl std::fmt::Display for CommitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitPhase::Admitted => write!(f, "admitted"),
            CommitPhase::Logged => write!(f, "logged"),
            CommitPhase::Indexed => write!(f, "indexed"),
        }
    }
}

/// Error type for the veridb engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed key, value, or path; rejected before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Overlapping key set with another in-flight transaction. Retryable.
    #[error("conflict on key {key:?} with in-flight transaction")]
    Conflict {
        /// The first overlapping key detected.
        key: Key,
    },

    /// The conflict wait list is saturated. Caller must back off.
    #[error("busy: wait list saturated")]
    Busy,

    /// Checksum or hash-chain mismatch on read. Fatal for the segment.
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// Read beyond committed offset, missing key, or missing remote object.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid configuration combination. The engine refuses to open.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Write attempted against a read-only store.
    #[error("store is read-only")]
    ReadOnly,

    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An error raised inside the commit pipeline, tagged with the
    /// transaction id and the phase it had reached.
    #[error("transaction {tx_id} failed in {phase} phase: {source}")]
    Commit {
        /// The transaction the failure belongs to.
        tx_id: TxId,
        /// Pipeline phase at failure time.
        phase: CommitPhase,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with commit-pipeline context.
    pub fn in_phase(self, tx_id: TxId, phase: CommitPhase) -> Error {
        Error::Commit {
            tx_id,
            phase,
            source: Box::new(self),
        }
    }

    /// Whether the caller may retry the operation after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display_names_key() {
        let err = Error::Conflict {
            key: Key::from("hot-key"),
        };
        assert!(err.to_string().contains("hot-key"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_phase_wrapping_preserves_source() {
        let io_err = io::Error::new(io::ErrorKind::Other, "disk full");
        let err = Error::from(io_err).in_phase(42, CommitPhase::Logged);
        let msg = err.to_string();
        assert!(msg.contains("transaction 42"));
        assert!(msg.contains("logged"));
        assert!(msg.contains("disk full"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_busy_is_retryable() {
        assert!(Error::Busy.is_retryable());
        assert!(!Error::ReadOnly.is_retryable());
        assert!(!Error::Corrupted("crc".into()).is_retryable());
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::NotFound("key missing".into());
        assert!(err.to_string().contains("not found"));
    }
}
