//! Write-set conflict control
//!
//! Each committing transaction registers its write set before entering the
//! commit pipeline. Two in-flight transactions conflict when their sets
//! overlap; the first registrant wins. The loser either fails immediately
//! with [`Error::Conflict`] or queues until the winner completes,
//! depending on the configured policy. The queue is bounded: past
//! `max_waitees` waiters, registration fails with [`Error::Busy`].

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use veri_core::{Error, Key, Result};

/// What a transaction does when its write set overlaps an in-flight one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Fail the commit immediately with [`Error::Conflict`].
    #[default]
    FailFast,
    /// Wait for the conflicting transaction to finish, then retry.
    Queue,
}

struct TableState {
    sets: FxHashMap<u64, FxHashSet<Key>>,
    next_token: u64,
    waiting: usize,
}

struct TableInner {
    state: Mutex<TableState>,
    released: Condvar,
    max_waitees: usize,
}

/// Registry of in-flight write sets.
pub struct WriteSetTable {
    inner: Arc<TableInner>,
}

impl WriteSetTable {
    /// Create a table admitting at most `max_waitees` queued transactions.
    pub fn new(max_waitees: usize) -> Self {
        WriteSetTable {
            inner: Arc::new(TableInner {
                state: Mutex::new(TableState {
                    sets: FxHashMap::default(),
                    next_token: 0,
                    waiting: 0,
                }),
                released: Condvar::new(),
                max_waitees,
            }),
        }
    }

    /// Register a write set, enforcing first-writer-wins.
    ///
    /// The returned guard unregisters the set on drop; hold it until the
    /// commit outcome (success or failure) is final.
    pub fn register(&self, keys: FxHashSet<Key>, policy: ConflictPolicy) -> Result<WriteSetGuard> {
        let mut state = self.inner.state.lock();
        loop {
            let overlap = state
                .sets
                .values()
                .flat_map(|set| set.intersection(&keys))
                .next()
                .cloned();
            match overlap {
                None => {
                    let token = state.next_token;
                    state.next_token += 1;
                    state.sets.insert(token, keys);
                    return Ok(WriteSetGuard {
                        inner: Arc::clone(&self.inner),
                        token,
                    });
                }
                Some(key) => match policy {
                    ConflictPolicy::FailFast => {
                        debug!(?key, "write-set conflict");
                        return Err(Error::Conflict { key });
                    }
                    ConflictPolicy::Queue => {
                        if state.waiting >= self.inner.max_waitees {
                            debug!(waiting = state.waiting, "wait list full");
                            return Err(Error::Busy);
                        }
                        state.waiting += 1;
                        self.inner.released.wait(&mut state);
                        state.waiting -= 1;
                    }
                },
            }
        }
    }

    /// Number of registered write sets.
    pub fn active(&self) -> usize {
        self.inner.state.lock().sets.len()
    }
}

/// RAII registration of one write set.
pub struct WriteSetGuard {
    inner: Arc<TableInner>,
    token: u64,
}

impl Drop for WriteSetGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.sets.remove(&self.token);
        self.inner.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> FxHashSet<Key> {
        names.iter().map(|n| Key::from(*n)).collect()
    }

    #[test]
    fn test_disjoint_sets_coexist() {
        let table = WriteSetTable::new(10);
        let _a = table
            .register(keys(&["a", "b"]), ConflictPolicy::FailFast)
            .unwrap();
        let _b = table
            .register(keys(&["c"]), ConflictPolicy::FailFast)
            .unwrap();
        assert_eq!(table.active(), 2);
    }

    #[test]
    fn test_overlap_fails_fast_with_key() {
        let table = WriteSetTable::new(10);
        let _a = table
            .register(keys(&["x", "y"]), ConflictPolicy::FailFast)
            .unwrap();
        match table.register(keys(&["y", "z"]), ConflictPolicy::FailFast) {
            Err(Error::Conflict { key }) => assert_eq!(key, Key::from("y")),
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_drop_releases_keys() {
        let table = WriteSetTable::new(10);
        let a = table
            .register(keys(&["k"]), ConflictPolicy::FailFast)
            .unwrap();
        drop(a);
        assert!(table.register(keys(&["k"]), ConflictPolicy::FailFast).is_ok());
    }

    #[test]
    fn test_queue_waits_for_winner() {
        let table = Arc::new(WriteSetTable::new(10));
        let winner = table
            .register(keys(&["contended"]), ConflictPolicy::Queue)
            .unwrap();

        let t2 = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                table
                    .register(keys(&["contended"]), ConflictPolicy::Queue)
                    .map(|_| ())
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(winner);
        t2.join().unwrap().unwrap();
    }

    #[test]
    fn test_waiter_bound_is_busy() {
        let table = Arc::new(WriteSetTable::new(0));
        let _winner = table
            .register(keys(&["k"]), ConflictPolicy::Queue)
            .unwrap();
        assert!(matches!(
            table.register(keys(&["k"]), ConflictPolicy::Queue),
            Err(Error::Busy)
        ));
    }
}
