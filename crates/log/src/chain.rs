//! Transaction hash chain
//!
//! Every committed transaction is summarized by a sequence of digests:
//!
//! ```text
//! entry_digest = SHA-256(key_len_le2 || key || meta_byte || value_ref_16)
//! eh           = SHA-256(entry_digest_1 || ... || entry_digest_n)
//! inner        = SHA-256(id_le8 || ts_le8 || eh)
//! alh          = SHA-256(prev_alh || inner || accumulator_root)
//! ```
//!
//! The accumulated linear hash (`alh`) binds the full history: changing any
//! byte of any earlier transaction changes every later `alh`. Binding the
//! Merkle accumulator root into `alh` makes logarithmic proofs verifiable
//! against an `alh` alone.

use sha2::{Digest as Sha2Digest, Sha256};

use veri_core::{Digest, TxEntry, TxId};

/// Digest of one transaction entry.
///
/// The value itself is not hashed; its location and length are, through the
/// 16-byte value reference, which in turn is validated against the value
/// log's checksummed frames.
pub fn entry_digest(entry: &TxEntry) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update((entry.key.as_bytes().len() as u16).to_le_bytes());
    hasher.update(entry.key.as_bytes());
    hasher.update([entry.meta.as_byte()]);
    hasher.update(entry.value_ref.to_bytes());
    hasher.finalize().into()
}

/// Digest of a transaction's full entry list.
pub fn entries_digest(entries: &[TxEntry]) -> Digest {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry_digest(entry));
    }
    hasher.finalize().into()
}

/// Inner transaction hash binding id, timestamp, and entry list.
pub fn inner_hash(id: TxId, ts: u64, eh: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(id.to_le_bytes());
    hasher.update(ts.to_le_bytes());
    hasher.update(eh);
    hasher.finalize().into()
}

/// Accumulated linear hash of the chain up to and including one transaction.
pub fn alh(prev_alh: &Digest, inner: &Digest, accumulator_root: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(prev_alh);
    hasher.update(inner);
    hasher.update(accumulator_root);
    hasher.finalize().into()
}
