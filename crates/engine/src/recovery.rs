//! Startup recovery
//!
//! The commit log is the single durability point, so recovery is anchored
//! there: replay every commit header, recompute the hash chain and the
//! Merkle accumulator, and stop at the first record that does not verify.
//! Everything past that point was torn by a crash (or tampered with) and is
//! truncated away in writable mode; a read-only open refuses instead.
//!
//! The index is derived state. If it trails the chain it is caught up by
//! replaying transaction entry lists; if it is somehow ahead (its commit
//! survived a chain truncation), it is wiped and rebuilt.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use veri_core::{Digest, Error, Result, TxId, NULL_DIGEST};
use veri_index::{NodeStore, NodeStoreOptions, Tree};
use veri_log::{chain, CommitLog, MerkleAccumulator, TxLog};

/// Verified chain state after replay.
pub(crate) struct ChainState {
    pub acc: MerkleAccumulator,
    pub head_id: TxId,
    pub head_alh: Digest,
}

/// Replay the commit log, validating the hash chain record by record.
///
/// Returns the state of the longest valid prefix. In writable mode the
/// commit log is truncated to that prefix; read-only mode treats any
/// invalid suffix as fatal.
pub(crate) fn rebuild_chain(clog: &CommitLog, read_only: bool) -> Result<ChainState> {
    let head = clog.head();
    let mut acc = MerkleAccumulator::new();
    let mut head_alh = NULL_DIGEST;
    let mut valid: TxId = 0;

    for id in 1..=head {
        let header = match clog.read_header(id) {
            Ok(header) => header,
            Err(e) => {
                warn!(tx_id = id, error = %e, "unreadable commit header");
                break;
            }
        };
        let inner = header.inner();
        acc.append(inner);
        let root = acc.root();
        let expected = chain::alh(&head_alh, &inner, &root);
        if header.prev_alh != head_alh || header.alh != expected {
            warn!(tx_id = id, "hash chain mismatch in commit header");
            acc.truncate(id - 1);
            break;
        }
        head_alh = expected;
        valid = id;
    }

    if valid < head {
        if read_only {
            return Err(Error::Corrupted(format!(
                "hash chain broken at transaction {} (head {})",
                valid + 1,
                head
            )));
        }
        warn!(valid, head, "truncating commit log to last valid transaction");
        clog.truncate(valid)?;
    }
    if valid > 0 {
        info!(head = valid, "hash chain verified");
    }

    Ok(ChainState {
        acc,
        head_id: valid,
        head_alh,
    })
}

/// Open the index, wiping it first if it claims more transactions than the
/// verified chain actually has.
pub(crate) fn open_index(
    dir: &Path,
    opts: NodeStoreOptions,
    max_node_size: usize,
    chain_head: TxId,
    read_only: bool,
) -> Result<Tree> {
    let store = Arc::new(NodeStore::open(dir, opts.clone())?);
    if store.indexed_up_to()? <= chain_head {
        return Tree::open(store, max_node_size);
    }
    if read_only {
        return Err(Error::Corrupted(format!(
            "index covers transaction {} but chain head is {}",
            store.indexed_up_to()?,
            chain_head
        )));
    }
    warn!(
        indexed = store.indexed_up_to()?,
        chain_head, "index ahead of chain, rebuilding from scratch"
    );
    drop(store);
    std::fs::remove_dir_all(dir)?;
    Tree::open(Arc::new(NodeStore::open(dir, opts)?), max_node_size)
}

/// Apply every transaction the index has not seen yet.
pub(crate) fn catch_up_index(tree: &mut Tree, clog: &CommitLog, txlog: &TxLog) -> Result<u64> {
    let head = clog.head();
    let mut applied = 0;
    while tree.indexed_up_to() < head {
        let id = tree.indexed_up_to() + 1;
        let header = clog.read_header(id)?;
        let entries = txlog.read(header.tx_off, id)?;
        tree.apply(id, &entries)?;
        applied += 1;
    }
    if applied > 0 {
        info!(applied, head, "index caught up with chain");
    }
    Ok(applied)
}
