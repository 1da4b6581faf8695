//! Index snapshots
//!
//! A snapshot is a root reference plus the transaction id it covers.
//! Shared subtrees make taking one free; the registry bounds how many can
//! be outstanding, since an active snapshot pins old node-log state and
//! blocks compaction.

use std::ops::Bound;
use std::sync::Arc;

use parking_lot::Mutex;

use veri_core::{Error, Key, Result, TxId};

use crate::node::{ChildRef, Node, Version};
use crate::store::NodeStore;

/// Immutable read view of the index at one transaction id.
pub struct Snapshot {
    store: Arc<NodeStore>,
    root: Option<ChildRef>,
    tx_id: TxId,
    _guard: Option<SnapshotGuard>,
}

impl Snapshot {
    pub(crate) fn new(store: Arc<NodeStore>, root: Option<ChildRef>, tx_id: TxId) -> Self {
        Snapshot {
            store,
            root,
            tx_id,
            _guard: None,
        }
    }

    /// Attach a registry guard so the snapshot counts against the
    /// outstanding-snapshot bound for its whole lifetime.
    pub fn with_guard(mut self, guard: SnapshotGuard) -> Self {
        self._guard = Some(guard);
        self
    }

    /// Transaction id this snapshot covers.
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    pub(crate) fn root(&self) -> Option<&ChildRef> {
        self.root.as_ref()
    }

    pub(crate) fn resolve(&self, child: &ChildRef) -> Result<Arc<Node>> {
        match child {
            ChildRef::Mem(node) => Ok(Arc::clone(node)),
            ChildRef::Disk(offset) => self.store.read_node(*offset),
        }
    }

    fn find_leaf_entry(
        &self,
        key: &Key,
    ) -> Result<Option<crate::node::LeafEntry>> {
        let mut current = match &self.root {
            None => return Ok(None),
            Some(root) => self.resolve(root)?,
        };
        loop {
            match &*current {
                Node::Leaf(entries) => {
                    return Ok(entries
                        .binary_search_by(|e| e.key.cmp(key))
                        .ok()
                        .map(|idx| entries[idx].clone()));
                }
                Node::Inner(children) => {
                    let idx = match children.iter().position(|c| c.max_key >= *key) {
                        Some(idx) => idx,
                        None => return Ok(None),
                    };
                    current = self.resolve(&children[idx].child)?;
                }
            }
        }
    }

    /// Latest version of `key` visible at this snapshot, deletion markers
    /// included.
    pub fn get(&self, key: &Key) -> Result<Option<Version>> {
        self.get_at(key, self.tx_id)
    }

    /// Latest version of `key` with `tx_id <= up_to`.
    pub fn get_at(&self, key: &Key, up_to: TxId) -> Result<Option<Version>> {
        Ok(self
            .find_leaf_entry(key)?
            .and_then(|e| e.version_at(up_to.min(self.tx_id)).copied()))
    }

    /// Full version history of `key`, ascending by transaction id,
    /// truncated to this snapshot.
    pub fn history(&self, key: &Key) -> Result<Vec<Version>> {
        Ok(self
            .find_leaf_entry(key)?
            .map(|e| {
                e.versions
                    .into_iter()
                    .filter(|v| v.tx_id <= self.tx_id)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Keys in `[start, end)`-style range with their latest visible,
    /// non-deleted version, ascending, at most `limit` results.
    pub fn scan(
        &self,
        start: Bound<&Key>,
        end: Bound<&Key>,
        limit: usize,
    ) -> Result<Vec<(Key, Version)>> {
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        if let Some(root) = &self.root {
            let root = self.resolve(root)?;
            self.scan_rec(&root, start, end, limit, &mut out)?;
        }
        Ok(out)
    }

    fn scan_rec(
        &self,
        node: &Node,
        start: Bound<&Key>,
        end: Bound<&Key>,
        limit: usize,
        out: &mut Vec<(Key, Version)>,
    ) -> Result<()> {
        match node {
            Node::Leaf(entries) => {
                for entry in entries {
                    if out.len() >= limit {
                        return Ok(());
                    }
                    if !after_start(&entry.key, start) {
                        continue;
                    }
                    if !before_end(&entry.key, end) {
                        return Ok(());
                    }
                    if let Some(v) = entry.version_at(self.tx_id) {
                        if !v.meta.is_deleted() {
                            out.push((entry.key.clone(), *v));
                        }
                    }
                }
            }
            Node::Inner(children) => {
                for child in children {
                    if out.len() >= limit {
                        return Ok(());
                    }
                    // Skip subtrees entirely below the range start.
                    if !after_start(&child.max_key, start) {
                        continue;
                    }
                    let node = self.resolve(&child.child)?;
                    self.scan_rec(&node, start, end, limit, out)?;
                    // Once a subtree's max key crosses the end bound, no
                    // later sibling can contribute.
                    if !before_end(&child.max_key, end) {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

fn after_start(key: &Key, start: Bound<&Key>) -> bool {
    match start {
        Bound::Unbounded => true,
        Bound::Included(s) => key >= s,
        Bound::Excluded(s) => key > s,
    }
}

fn before_end(key: &Key, end: Bound<&Key>) -> bool {
    match end {
        Bound::Unbounded => true,
        Bound::Included(e) => key <= e,
        Bound::Excluded(e) => key < e,
    }
}

struct RegistryState {
    active: usize,
}

/// Bounds the number of outstanding snapshots.
pub struct SnapshotRegistry {
    max_active: usize,
    state: Arc<Mutex<RegistryState>>,
}

impl SnapshotRegistry {
    /// Create a registry admitting at most `max_active` snapshots.
    pub fn new(max_active: usize) -> Self {
        SnapshotRegistry {
            max_active: max_active.max(1),
            state: Arc::new(Mutex::new(RegistryState { active: 0 })),
        }
    }

    /// Register a new snapshot; [`Error::Busy`] once the bound is reached.
    pub fn acquire(&self) -> Result<SnapshotGuard> {
        let mut state = self.state.lock();
        if state.active >= self.max_active {
            return Err(Error::Busy);
        }
        state.active += 1;
        Ok(SnapshotGuard {
            state: Arc::clone(&self.state),
        })
    }

    /// Number of snapshots currently outstanding.
    pub fn active(&self) -> usize {
        self.state.lock().active
    }
}

/// RAII registration of one snapshot.
pub struct SnapshotGuard {
    state: Arc<Mutex<RegistryState>>,
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.state.lock().active -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NodeStoreOptions;
    use crate::tree::Tree;
    use tempfile::tempdir;
    use veri_core::{EntryMeta, TxEntry, ValueRef};

    fn entry(key: &str, tx_id: TxId, deleted: bool) -> TxEntry {
        TxEntry {
            key: Key::from(key),
            value_ref: ValueRef {
                segment: 1,
                offset: tx_id * 10,
                len: 4,
            },
            meta: if deleted {
                EntryMeta::deleted()
            } else {
                EntryMeta::none()
            },
        }
    }

    fn populated_tree(dir: &std::path::Path) -> Tree {
        let store = Arc::new(NodeStore::open(dir, NodeStoreOptions::default()).unwrap());
        let mut tree = Tree::open(store, 4).unwrap();
        let mut tx = 0;
        for key in ["apple", "banana", "cherry", "date", "elder", "fig"] {
            tx += 1;
            tree.apply(tx, &[entry(key, tx, false)]).unwrap();
        }
        tree
    }

    #[test]
    fn test_scan_range() {
        let dir = tempdir().unwrap();
        let tree = populated_tree(dir.path());
        let snap = tree.snapshot();

        let from = Key::from("banana");
        let to = Key::from("elder");
        let hits = snap
            .scan(Bound::Included(&from), Bound::Excluded(&to), 100)
            .unwrap();
        let keys: Vec<_> = hits
            .iter()
            .map(|(k, _)| String::from_utf8_lossy(k.as_bytes()).to_string())
            .collect();
        assert_eq!(keys, vec!["banana", "cherry", "date"]);
    }

    #[test]
    fn test_scan_limit_and_unbounded() {
        let dir = tempdir().unwrap();
        let tree = populated_tree(dir.path());
        let snap = tree.snapshot();

        let hits = snap.scan(Bound::Unbounded, Bound::Unbounded, 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, Key::from("apple"));
    }

    #[test]
    fn test_scan_skips_deleted() {
        let dir = tempdir().unwrap();
        let mut tree = populated_tree(dir.path());
        tree.apply(7, &[entry("cherry", 7, true)]).unwrap();
        let snap = tree.snapshot();

        let hits = snap.scan(Bound::Unbounded, Bound::Unbounded, 100).unwrap();
        assert!(hits.iter().all(|(k, _)| *k != Key::from("cherry")));
        // The tombstone is still visible to point reads.
        assert!(snap
            .get(&Key::from("cherry"))
            .unwrap()
            .unwrap()
            .meta
            .is_deleted());
    }

    #[test]
    fn test_get_at_historical() {
        let dir = tempdir().unwrap();
        let store = Arc::new(NodeStore::open(dir.path(), NodeStoreOptions::default()).unwrap());
        let mut tree = Tree::open(store, 4).unwrap();
        for tx in 1..=4u64 {
            tree.apply(tx, &[entry("k", tx, false)]).unwrap();
        }
        let snap = tree.snapshot();
        assert_eq!(snap.get_at(&Key::from("k"), 2).unwrap().unwrap().tx_id, 2);
        // up_to past the snapshot is clamped.
        assert_eq!(snap.get_at(&Key::from("k"), 99).unwrap().unwrap().tx_id, 4);
    }

    #[test]
    fn test_registry_bounds_snapshots() {
        let registry = SnapshotRegistry::new(2);
        let a = registry.acquire().unwrap();
        let _b = registry.acquire().unwrap();
        assert!(matches!(registry.acquire(), Err(Error::Busy)));
        drop(a);
        assert!(registry.acquire().is_ok());
    }
}
