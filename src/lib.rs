//! veridb: a tamper-evident embedded storage engine
//!
//! Every transaction is appended to a hash-chained commit log and folded
//! into a Merkle accumulator, so any committed state can later be proven
//! consistent with any earlier one. A persistent copy-on-write index keeps
//! every version of every key addressable by transaction id.
//!
//! # Example
//!
//! ```no_run
//! use veridb::{Key, Options, Store, Transaction};
//!
//! # fn main() -> veridb::Result<()> {
//! let store = Store::open("./data".as_ref(), Options::default())?;
//!
//! let mut tx = Transaction::new();
//! tx.set("greeting", b"hello".to_vec())?;
//! let header = store.commit(tx)?;
//!
//! let (tx_id, value) = store.get(&Key::from("greeting"))?.unwrap();
//! assert_eq!((tx_id, value), (header.id, b"hello".to_vec()));
//!
//! // Prove the transaction is part of the current history.
//! let (head_id, head_alh) = store.commit_state();
//! let proof = store.inclusion_proof(header.id, head_id)?;
//! assert!(veridb::verify_inclusion_proof(
//!     &proof,
//!     header.id,
//!     &header.inner(),
//!     head_id,
//!     &head_alh,
//! ));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use veri_core::{
    CommitPhase, Digest, EntryMeta, Error, Key, Limits, Result, TxEntry, TxId, ValueRef,
    NULL_DIGEST,
};

pub use veri_log::{
    verify_consistency_proof, verify_inclusion_proof, ConsistencyProof, HeaderBinding,
    InclusionProof, LinearStep, MemoryStorage, RemoteStorage, TxHeader,
};

pub use veri_log::appendlog::Compression;

pub use veri_concurrency::ConflictPolicy;

pub use veri_engine::{IndexOptions, Options, Store, StoreSnapshot, Transaction};
