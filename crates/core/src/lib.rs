//! Shared types for the veridb engine
//!
//! This crate defines the vocabulary every other crate speaks:
//!
//! - Transaction ids, keys, value references, entry metadata
//! - The error taxonomy (`Error`, `Result`, commit-phase wrapping)
//! - Size limits enforced before any I/O happens

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod limits;
pub mod types;

pub use error::{CommitPhase, Error, Result};
pub use limits::{Limits, MAX_FILE_SIZE, MAX_KEY_LEN, MAX_PARALLEL_IO};
pub use types::{Digest, EntryMeta, Key, TxEntry, TxId, ValueRef, NULL_DIGEST};
