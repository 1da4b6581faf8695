//! Inclusion and consistency proofs
//!
//! Proofs come in two shapes:
//!
//! - **Logarithmic**: an audit path through the Merkle accumulator plus the
//!   header bindings needed to tie the accumulator roots to the accumulated
//!   linear hashes the verifier trusts.
//! - **Linear**: a walk along the hash chain itself, one step per
//!   transaction. Cheap to produce for short spans, unbounded otherwise;
//!   the engine caps the span it will serve.
//!
//! Verification is pure: it consumes only the proof and the digests the
//! caller already trusts, and returns a plain `bool`.

use serde::{Deserialize, Serialize};

use veri_core::{Digest, TxId};

use crate::chain;
use crate::mtree::{root_from_inclusion, roots_from_consistency};

/// The chain-relevant fields of one transaction header.
///
/// `alh()` recomputes the accumulated linear hash the binding implies; a
/// verifier checks it against a digest it already trusts before relying on
/// any field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderBinding {
    /// Accumulated linear hash of the preceding transaction.
    pub prev_alh: Digest,
    /// Inner hash of this transaction.
    pub inner: Digest,
    /// Accumulator root after this transaction.
    pub root: Digest,
}

impl HeaderBinding {
    /// The accumulated linear hash this binding implies.
    pub fn alh(&self) -> Digest {
        chain::alh(&self.prev_alh, &self.inner, &self.root)
    }
}

/// One step of a linear proof: the chain inputs of a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearStep {
    /// Inner hash of the transaction.
    pub inner: Digest,
    /// Accumulator root after the transaction.
    pub root: Digest,
}

/// Fold a chain of linear steps starting from a known alh.
fn fold_linear(start: Digest, steps: &[LinearStep]) -> Digest {
    steps
        .iter()
        .fold(start, |acc, step| chain::alh(&acc, &step.inner, &step.root))
}

/// Proof that one transaction is part of the history ending at a trusted
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InclusionProof {
    /// Audit path through the accumulator, anchored at the target header.
    Logarithmic {
        /// Binding of the trusted target transaction.
        target: HeaderBinding,
        /// Accumulator audit path for the proven leaf, leaf to root.
        path: Vec<Digest>,
    },
    /// Chain walk from the proven transaction to the target.
    Linear {
        /// Binding of the proven transaction itself.
        source: HeaderBinding,
        /// Chain inputs of each following transaction, up to the target.
        steps: Vec<LinearStep>,
    },
}

/// Verify that transaction `tx_id` with inner hash `inner` is included in
/// the history whose transaction `target_id` has accumulated linear hash
/// `target_alh`.
pub fn verify_inclusion_proof(
    proof: &InclusionProof,
    tx_id: TxId,
    inner: &Digest,
    target_id: TxId,
    target_alh: &Digest,
) -> bool {
    if tx_id == 0 || tx_id > target_id {
        return false;
    }
    match proof {
        InclusionProof::Logarithmic { target, path } => {
            if target.alh() != *target_alh {
                return false;
            }
            match root_from_inclusion(inner, tx_id - 1, target_id, path) {
                Ok(root) => root == target.root,
                Err(_) => false,
            }
        }
        InclusionProof::Linear { source, steps } => {
            if source.inner != *inner {
                return false;
            }
            if steps.len() as u64 != target_id - tx_id {
                return false;
            }
            fold_linear(source.alh(), steps) == *target_alh
        }
    }
}

/// Proof that a trusted earlier state is a prefix of a trusted later state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyProof {
    /// Accumulator consistency path between the two tree sizes.
    Logarithmic {
        /// Binding of the earlier transaction.
        old: HeaderBinding,
        /// Binding of the later transaction.
        new: HeaderBinding,
        /// Consistency path between the two accumulator sizes.
        path: Vec<Digest>,
    },
    /// Chain walk from the earlier transaction to the later one.
    Linear {
        /// Binding of the earlier transaction.
        old: HeaderBinding,
        /// Chain inputs of each following transaction, up to the later one.
        steps: Vec<LinearStep>,
    },
}

/// Verify that the history at `old_id` (with alh `old_alh`) is a prefix of
/// the history at `new_id` (with alh `new_alh`).
pub fn verify_consistency_proof(
    proof: &ConsistencyProof,
    old_id: TxId,
    old_alh: &Digest,
    new_id: TxId,
    new_alh: &Digest,
) -> bool {
    if old_id == 0 || old_id > new_id {
        return false;
    }
    match proof {
        ConsistencyProof::Logarithmic { old, new, path } => {
            if old.alh() != *old_alh || new.alh() != *new_alh {
                return false;
            }
            match roots_from_consistency(old_id, new_id, &old.root, path) {
                Ok((fr, sr)) => fr == old.root && sr == new.root,
                Err(_) => false,
            }
        }
        ConsistencyProof::Linear { old, steps } => {
            if old.alh() != *old_alh {
                return false;
            }
            if steps.len() as u64 != new_id - old_id {
                return false;
            }
            fold_linear(*old_alh, steps) == *new_alh
        }
    }
}
