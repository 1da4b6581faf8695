//! Copy-on-write versioned B-tree
//!
//! The tree maps each key to its full version history. Applying a
//! transaction copies the path from root to the touched leaves; untouched
//! subtrees are shared with earlier roots, which is what makes snapshots
//! free. Dirty nodes stay in memory until [`Tree::flush`] writes them to
//! the node log bottom-up and records a commit.
//!
//! Writers apply transactions in id order, one at a time; readers work on
//! snapshots and never see a half-applied transaction.

use std::sync::Arc;

use tracing::debug;

use veri_core::{Error, Key, Result, TxEntry, TxId};

use crate::node::{ChildRef, InnerChild, LeafEntry, Node, Version};
use crate::snapshot::Snapshot;
use crate::store::NodeStore;

/// Default maximum entries (or children) per node.
pub const DEFAULT_MAX_NODE_SIZE: usize = 64;

enum Outcome {
    One(Arc<Node>),
    Split(Arc<Node>, Arc<Node>),
}

/// The writable head of the index.
pub struct Tree {
    store: Arc<NodeStore>,
    root: Option<ChildRef>,
    indexed_up_to: TxId,
    max_node_size: usize,
    /// Versions superseded since the current generation was built; feeds
    /// the compaction threshold.
    stale_versions: u64,
}

impl Tree {
    /// Open the tree from the store's last durable commit.
    pub fn open(store: Arc<NodeStore>, max_node_size: usize) -> Result<Self> {
        let commit = store.last_commit()?;
        Ok(Tree {
            store,
            root: commit.and_then(|c| c.root).map(ChildRef::Disk),
            indexed_up_to: commit.map(|c| c.tx_id).unwrap_or(0),
            max_node_size: max_node_size.max(2),
            stale_versions: 0,
        })
    }

    /// Highest transaction id applied (not necessarily flushed).
    pub fn indexed_up_to(&self) -> TxId {
        self.indexed_up_to
    }

    /// Versions superseded by newer writes since the current generation.
    pub fn stale_versions(&self) -> u64 {
        self.stale_versions
    }

    /// A read view of the tree as of the last applied transaction.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            Arc::clone(&self.store),
            self.root.clone(),
            self.indexed_up_to,
        )
    }

    /// Apply the entries of transaction `tx_id`.
    ///
    /// Transactions must arrive in id order with no gaps.
    pub fn apply(&mut self, tx_id: TxId, entries: &[TxEntry]) -> Result<()> {
        if tx_id != self.indexed_up_to + 1 {
            return Err(Error::InvalidArgument(format!(
                "indexing transaction {} after {}",
                tx_id, self.indexed_up_to
            )));
        }
        for entry in entries {
            let version = Version {
                tx_id,
                value_ref: entry.value_ref,
                meta: entry.meta,
            };
            self.insert(&entry.key, version)?;
        }
        self.indexed_up_to = tx_id;
        Ok(())
    }

    fn insert(&mut self, key: &Key, version: Version) -> Result<()> {
        let root = match self.root.take() {
            None => {
                self.root = Some(ChildRef::Mem(Arc::new(Node::Leaf(vec![LeafEntry {
                    key: key.clone(),
                    versions: vec![version],
                }]))));
                return Ok(());
            }
            Some(root) => root,
        };

        match self.insert_rec(&root, key, version)? {
            Outcome::One(node) => {
                self.root = Some(ChildRef::Mem(node));
            }
            Outcome::Split(left, right) => {
                let children = vec![
                    InnerChild {
                        max_key: left.max_key().expect("split node is non-empty").clone(),
                        child: ChildRef::Mem(left),
                    },
                    InnerChild {
                        max_key: right.max_key().expect("split node is non-empty").clone(),
                        child: ChildRef::Mem(right),
                    },
                ];
                self.root = Some(ChildRef::Mem(Arc::new(Node::Inner(children))));
            }
        }
        Ok(())
    }

    fn resolve(&self, child: &ChildRef) -> Result<Arc<Node>> {
        match child {
            ChildRef::Mem(node) => Ok(Arc::clone(node)),
            ChildRef::Disk(offset) => self.store.read_node(*offset),
        }
    }

    fn insert_rec(&mut self, child: &ChildRef, key: &Key, version: Version) -> Result<Outcome> {
        let node = self.resolve(child)?;
        match &*node {
            Node::Leaf(entries) => {
                let mut entries = entries.clone();
                match entries.binary_search_by(|e| e.key.cmp(key)) {
                    Ok(idx) => {
                        entries[idx].versions.push(version);
                        self.stale_versions += 1;
                    }
                    Err(idx) => entries.insert(
                        idx,
                        LeafEntry {
                            key: key.clone(),
                            versions: vec![version],
                        },
                    ),
                }
                Ok(self.maybe_split_leaf(entries))
            }
            Node::Inner(children) => {
                let mut children = children.clone();
                let idx = children
                    .iter()
                    .position(|c| c.max_key >= *key)
                    .unwrap_or(children.len() - 1);
                match self.insert_rec(&children[idx].child, key, version)? {
                    Outcome::One(node) => {
                        children[idx] = InnerChild {
                            max_key: node.max_key().expect("non-empty child").clone(),
                            child: ChildRef::Mem(node),
                        };
                    }
                    Outcome::Split(left, right) => {
                        children[idx] = InnerChild {
                            max_key: left.max_key().expect("non-empty child").clone(),
                            child: ChildRef::Mem(left),
                        };
                        children.insert(
                            idx + 1,
                            InnerChild {
                                max_key: right.max_key().expect("non-empty child").clone(),
                                child: ChildRef::Mem(right),
                            },
                        );
                    }
                }
                Ok(self.maybe_split_inner(children))
            }
        }
    }

    fn maybe_split_leaf(&self, entries: Vec<LeafEntry>) -> Outcome {
        if entries.len() <= self.max_node_size {
            return Outcome::One(Arc::new(Node::Leaf(entries)));
        }
        let mid = entries.len() / 2;
        let mut left = entries;
        let right = left.split_off(mid);
        Outcome::Split(Arc::new(Node::Leaf(left)), Arc::new(Node::Leaf(right)))
    }

    fn maybe_split_inner(&self, children: Vec<InnerChild>) -> Outcome {
        if children.len() <= self.max_node_size {
            return Outcome::One(Arc::new(Node::Inner(children)));
        }
        let mid = children.len() / 2;
        let mut left = children;
        let right = left.split_off(mid);
        Outcome::Split(Arc::new(Node::Inner(left)), Arc::new(Node::Inner(right)))
    }

    /// Write all dirty nodes to the node log and record a commit covering
    /// everything applied so far. With `sync`, the commit is made durable.
    pub fn flush(&mut self, sync: bool) -> Result<()> {
        let root_off = match self.root.take() {
            None => None,
            Some(root) => {
                let offset = self.persist(&root)?;
                self.root = Some(ChildRef::Disk(offset));
                Some(offset)
            }
        };
        self.store.commit(self.indexed_up_to, root_off, sync)?;
        debug!(
            tx_id = self.indexed_up_to,
            root = ?root_off,
            "index flushed"
        );
        Ok(())
    }

    fn persist(&self, child: &ChildRef) -> Result<u64> {
        match child {
            ChildRef::Disk(offset) => Ok(*offset),
            ChildRef::Mem(node) => match &**node {
                Node::Leaf(_) => self.store.append_node(node),
                Node::Inner(children) => {
                    let mut flushed = Vec::with_capacity(children.len());
                    for c in children {
                        flushed.push(InnerChild {
                            max_key: c.max_key.clone(),
                            child: ChildRef::Disk(self.persist(&c.child)?),
                        });
                    }
                    self.store.append_node(&Node::Inner(flushed))
                }
            },
        }
    }

    /// Swap in a compacted root (generation handover). Resets the stale
    /// counter; the new generation contains only live nodes.
    pub(crate) fn replace_root(&mut self, root: Option<u64>) {
        self.root = root.map(ChildRef::Disk);
        self.stale_versions = 0;
    }

    pub(crate) fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NodeStoreOptions;
    use tempfile::tempdir;
    use veri_core::{EntryMeta, ValueRef};

    fn entry(key: &str, tx_id: TxId) -> TxEntry {
        TxEntry {
            key: Key::from(key),
            value_ref: ValueRef {
                segment: 1,
                offset: tx_id * 100,
                len: 8,
            },
            meta: EntryMeta::none(),
        }
    }

    fn open_tree(dir: &std::path::Path, max_node_size: usize) -> Tree {
        let store = Arc::new(NodeStore::open(dir, NodeStoreOptions::default()).unwrap());
        Tree::open(store, max_node_size).unwrap()
    }

    #[test]
    fn test_apply_and_read_back() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(dir.path(), 4);

        tree.apply(1, &[entry("b", 1), entry("a", 1)]).unwrap();
        tree.apply(2, &[entry("c", 2)]).unwrap();

        let snap = tree.snapshot();
        assert_eq!(snap.get(&Key::from("a")).unwrap().unwrap().tx_id, 1);
        assert_eq!(snap.get(&Key::from("c")).unwrap().unwrap().tx_id, 2);
        assert!(snap.get(&Key::from("zz")).unwrap().is_none());
    }

    #[test]
    fn test_gapless_tx_order_enforced() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(dir.path(), 4);
        tree.apply(1, &[entry("a", 1)]).unwrap();
        assert!(tree.apply(3, &[entry("b", 3)]).is_err());
    }

    #[test]
    fn test_many_keys_split_and_survive_flush() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(dir.path(), 4);

        for tx in 1..=200u64 {
            tree.apply(tx, &[entry(&format!("key-{:04}", tx), tx)])
                .unwrap();
        }
        tree.flush(true).unwrap();

        let snap = tree.snapshot();
        for tx in 1..=200u64 {
            let v = snap.get(&Key::from(format!("key-{:04}", tx).as_str())).unwrap();
            assert_eq!(v.unwrap().tx_id, tx);
        }
    }

    #[test]
    fn test_reopen_resumes_from_flushed_state() {
        let dir = tempdir().unwrap();
        {
            let mut tree = open_tree(dir.path(), 4);
            for tx in 1..=50u64 {
                tree.apply(tx, &[entry(&format!("k{:03}", tx), tx)]).unwrap();
            }
            tree.flush(true).unwrap();
        }
        let mut tree = open_tree(dir.path(), 4);
        assert_eq!(tree.indexed_up_to(), 50);
        tree.apply(51, &[entry("fresh", 51)]).unwrap();
        let snap = tree.snapshot();
        assert!(snap.get(&Key::from("fresh")).unwrap().is_some());
        assert!(snap.get(&Key::from("k001")).unwrap().is_some());
    }

    #[test]
    fn test_overwrites_keep_history_and_count_stale() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(dir.path(), 4);
        for tx in 1..=5u64 {
            tree.apply(tx, &[entry("hot", tx)]).unwrap();
        }
        assert_eq!(tree.stale_versions(), 4);

        let snap = tree.snapshot();
        let history = snap.history(&Key::from("hot")).unwrap();
        assert_eq!(
            history.iter().map(|v| v.tx_id).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(dir.path(), 4);
        tree.apply(1, &[entry("a", 1)]).unwrap();
        let snap = tree.snapshot();
        tree.apply(2, &[entry("a", 2), entry("b", 2)]).unwrap();

        assert_eq!(snap.get(&Key::from("a")).unwrap().unwrap().tx_id, 1);
        assert!(snap.get(&Key::from("b")).unwrap().is_none());
        assert_eq!(
            tree.snapshot().get(&Key::from("a")).unwrap().unwrap().tx_id,
            2
        );
    }
}
