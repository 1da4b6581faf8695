//! Tamper-evident embedded storage engine
//!
//! The engine combines the durable logs, the hash chain, and the versioned
//! index into a single [`Store`]:
//!
//! ```text
//! Transaction ---> Coordinator ---> ValueLog
//!                      |            TxLog
//!                      |            CommitLog  (durability point)
//!                      v               |
//!                  hash chain <--------+
//!                      |
//!                      v
//!                  Tree (versioned index) --> Snapshots
//! ```
//!
//! Every committed transaction extends an accumulated linear hash and a
//! Merkle accumulator; inclusion and consistency proofs let a client verify
//! history without trusting the store.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod options;
mod recovery;
pub mod store;
pub mod transaction;

pub use options::{IndexOptions, Options};
pub use store::{Store, StoreSnapshot};
pub use transaction::Transaction;
