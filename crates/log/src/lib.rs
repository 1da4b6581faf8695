//! Durable log layer for veridb
//!
//! This crate owns everything that touches transaction-log disk state:
//!
//! - Segmented appendable logs with framed, checksummed records
//! - Value log: entry payloads addressed by (segment, offset, length)
//! - Transaction log: per-transaction entry lists
//! - Commit log: fixed-layout headers, O(1) lookup by transaction id
//! - Hash chain and Merkle accumulator, inclusion/consistency proofs
//! - Remote archival interface and cold-segment offload

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod appendlog;
pub mod chain;
pub mod codec;
pub mod commit;
pub mod mtree;
pub mod pool;
pub mod proof;
pub mod remote;
pub mod segment;
pub mod txlog;
pub mod vlog;

pub use appendlog::{AppendLog, AppendOptions, Compression};
pub use chain::{alh, entries_digest, entry_digest, inner_hash};
pub use commit::{CommitLog, TxHeader, COMMIT_RECORD_SIZE};
pub use mtree::MerkleAccumulator;
pub use proof::{
    verify_consistency_proof, verify_inclusion_proof, ConsistencyProof, HeaderBinding,
    InclusionProof, LinearStep,
};
pub use remote::{EntryInfo, MemoryStorage, Offloader, RemoteStorage};
pub use segment::{Segment, SegmentHeader, SEGMENT_HEADER_SIZE};
pub use txlog::TxLog;
pub use vlog::ValueLog;
