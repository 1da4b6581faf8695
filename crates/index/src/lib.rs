//! Persistent versioned key index for veridb
//!
//! A copy-on-write B-tree mapping each key to its full version history.
//! The index is derived state: it trails the transaction log and is
//! rebuilt from it after a crash, so its durability rules are looser than
//! the log's (flush and sync thresholds instead of per-commit fsync).
//!
//! - Nodes are persisted to an append-only node log per generation
//! - A fixed-record commit log ties roots to transaction ids
//! - Snapshots pin a root and read it without blocking the writer
//! - Compaction rewrites the live tree into a fresh generation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod compaction;
pub mod node;
pub mod snapshot;
pub mod store;
pub mod tree;

pub use cache::NodeCache;
pub use compaction::compact;
pub use node::{ChildRef, InnerChild, LeafEntry, Node, Version};
pub use snapshot::{Snapshot, SnapshotGuard, SnapshotRegistry};
pub use store::{generation_dir, IndexCommit, NodeStore, NodeStoreOptions};
pub use tree::{Tree, DEFAULT_MAX_NODE_SIZE};
