//! LRU cache of deserialized index nodes
//!
//! Keyed by node-log offset. Offsets are never reused within a generation,
//! so cached nodes cannot go stale; compaction clears the cache wholesale
//! when it switches generations.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::node::Node;

struct CacheState {
    map: FxHashMap<u64, (Arc<Node>, u64)>,
    /// Access queue with lazy invalidation: an offset may appear several
    /// times, only the entry matching the map's tick counts.
    queue: VecDeque<(u64, u64)>,
    tick: u64,
}

/// Bounded LRU cache of index nodes.
pub struct NodeCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl NodeCache {
    /// Create a cache holding at most `capacity` nodes.
    pub fn new(capacity: usize) -> Self {
        NodeCache {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                map: FxHashMap::default(),
                queue: VecDeque::new(),
                tick: 0,
            }),
        }
    }

    /// Look up the node at `offset`, refreshing its recency.
    pub fn get(&self, offset: u64) -> Option<Arc<Node>> {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        let node = match state.map.get_mut(&offset) {
            Some((node, last)) => {
                *last = tick;
                Arc::clone(node)
            }
            None => return None,
        };
        state.queue.push_back((offset, tick));
        Some(node)
    }

    /// Insert the node at `offset`, evicting least-recently-used nodes if
    /// the cache is full.
    pub fn put(&self, offset: u64, node: Arc<Node>) {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        state.map.insert(offset, (node, tick));
        state.queue.push_back((offset, tick));

        while state.map.len() > self.capacity {
            match state.queue.pop_front() {
                Some((off, t)) => {
                    let current = state.map.get(&off).map(|(_, last)| *last);
                    if current == Some(t) {
                        state.map.remove(&off);
                    }
                }
                None => break,
            }
        }
    }

    /// Drop everything (generation switch).
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.map.clear();
        state.queue.clear();
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
