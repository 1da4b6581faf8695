//! Commit admission and conflict control for veridb
//!
//! The engine serializes the chain itself; this crate gates everything
//! before that point: how many transactions may be in flight, how parallel
//! value-log I/O is, and what happens when two in-flight transactions
//! write the same key.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod coordinator;

pub use conflict::{ConflictPolicy, WriteSetGuard, WriteSetTable};
pub use coordinator::{AdmissionGuard, Coordinator, CoordinatorOptions, IoPermit};
