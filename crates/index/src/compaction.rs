//! Index compaction
//!
//! Copy-on-write flushes leave superseded node versions behind in the node
//! log; they are unreachable but still occupy disk. Compaction rewrites the
//! live tree into a fresh generation directory and switches over with one
//! durable commit record, after which the old generation is deleted.
//!
//! The caller must hold the tree exclusively and ensure no snapshots are
//! outstanding: they would keep referencing the deleted generation. An
//! optional per-node delay throttles compaction I/O so foreground traffic
//! is not starved.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use veri_core::Result;

use crate::node::{ChildRef, InnerChild, Node};
use crate::store::open_generation_log;
use crate::tree::Tree;

use veri_log::appendlog::AppendLog;

/// Rewrite the live tree into the next generation and switch over.
///
/// Returns the number of nodes written. The tree is flushed first, so the
/// rewrite works from a fully persisted root.
pub fn compact(tree: &mut Tree, delay: Duration) -> Result<u64> {
    tree.flush(true)?;
    let store = Arc::clone(tree.store());
    let snapshot = tree.snapshot();
    let tx_id = snapshot.tx_id();

    let generation = store.generation() + 1;
    let log = open_generation_log(store.dir(), generation, store.options())?;

    let mut written = 0u64;
    let root = match snapshot.root() {
        None => None,
        Some(root) => Some(copy_subtree(&snapshot, root, &log, delay, &mut written)?),
    };
    log.sync()?;
    drop(log);
    drop(snapshot);

    store.switch_generation(generation, tx_id, root)?;
    tree.replace_root(root);
    info!(generation, nodes = written, "index compacted");
    Ok(written)
}

fn copy_subtree(
    snapshot: &crate::snapshot::Snapshot,
    child: &ChildRef,
    log: &AppendLog,
    delay: Duration,
    written: &mut u64,
) -> Result<u64> {
    let node = snapshot.resolve(child)?;
    let offset = match &*node {
        Node::Leaf(_) => log.append(&node.to_bytes()?)?,
        Node::Inner(children) => {
            let mut copied = Vec::with_capacity(children.len());
            for c in children {
                copied.push(InnerChild {
                    max_key: c.max_key.clone(),
                    child: ChildRef::Disk(copy_subtree(snapshot, &c.child, log, delay, written)?),
                });
            }
            log.append(&Node::Inner(copied).to_bytes()?)?
        }
    };
    *written += 1;
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
    Ok(offset)
}
