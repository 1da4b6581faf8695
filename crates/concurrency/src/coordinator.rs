//! Commit admission and I/O permits
//!
//! Two FIFO semaphores gate the commit pipeline:
//!
//! - **Admission** bounds how many transactions are in flight at once.
//!   Waiters past `max_waitees` are rejected with [`Error::Busy`] instead
//!   of queueing without bound.
//! - **I/O permits** bound how many value-log appends run in parallel
//!   within one committing transaction's batch.
//!
//! Both are ticket-ordered: a permit released under contention goes to the
//! longest waiter, so a burst of small transactions cannot starve a large
//! one.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use veri_core::{Error, Result};

use crate::conflict::{ConflictPolicy, WriteSetGuard, WriteSetTable};

struct SemState {
    available: usize,
    next_ticket: u64,
    now_serving: u64,
    waiting: usize,
}

struct SemInner {
    state: Mutex<SemState>,
    released: Condvar,
    permits: usize,
    /// `None` means waiters queue without bound.
    max_waitees: Option<usize>,
}

/// Ticket-ordered counting semaphore.
struct Semaphore {
    inner: Arc<SemInner>,
}

impl Semaphore {
    fn new(permits: usize, max_waitees: Option<usize>) -> Self {
        Semaphore {
            inner: Arc::new(SemInner {
                state: Mutex::new(SemState {
                    available: permits.max(1),
                    next_ticket: 0,
                    now_serving: 0,
                    waiting: 0,
                }),
                released: Condvar::new(),
                permits: permits.max(1),
                max_waitees,
            }),
        }
    }

    fn acquire(&self) -> Result<Permit> {
        let mut state = self.inner.state.lock();
        if let Some(max) = self.inner.max_waitees {
            let contended = state.available == 0 || state.next_ticket != state.now_serving;
            if contended && state.waiting >= max {
                return Err(Error::Busy);
            }
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiting += 1;
        while state.now_serving != ticket || state.available == 0 {
            self.inner.released.wait(&mut state);
        }
        state.waiting -= 1;
        state.available -= 1;
        state.now_serving += 1;
        self.inner.released.notify_all();
        Ok(Permit {
            inner: Arc::clone(&self.inner),
        })
    }

    fn in_use(&self) -> usize {
        let state = self.inner.state.lock();
        self.inner.permits - state.available
    }
}

/// RAII permit of a [`Semaphore`].
struct Permit {
    inner: Arc<SemInner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.available += 1;
        self.inner.released.notify_all();
    }
}

/// Admission slot of one in-flight transaction.
pub struct AdmissionGuard {
    _permit: Permit,
}

/// Permission to run one parallel value-log append.
pub struct IoPermit {
    _permit: Permit,
}

/// Tuning knobs of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Transactions allowed in flight at once.
    pub max_concurrency: usize,
    /// Parallel value-log appends per commit batch.
    pub max_io_concurrency: usize,
    /// Queued transactions (admission plus conflict queue) before `Busy`.
    pub max_waitees: usize,
    /// Behavior on write-set overlap.
    pub conflict_policy: ConflictPolicy,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        CoordinatorOptions {
            max_concurrency: 30,
            max_io_concurrency: 1,
            max_waitees: 1000,
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

/// Gates the commit pipeline: admission, write-set conflicts, I/O permits.
pub struct Coordinator {
    admission: Semaphore,
    io: Semaphore,
    writes: WriteSetTable,
    policy: ConflictPolicy,
}

impl Coordinator {
    /// Create a coordinator from its options.
    pub fn new(opts: CoordinatorOptions) -> Self {
        Coordinator {
            admission: Semaphore::new(opts.max_concurrency, Some(opts.max_waitees)),
            io: Semaphore::new(opts.max_io_concurrency, None),
            writes: WriteSetTable::new(opts.max_waitees),
            policy: opts.conflict_policy,
        }
    }

    /// Admit one transaction into the pipeline.
    pub fn admit(&self) -> Result<AdmissionGuard> {
        Ok(AdmissionGuard {
            _permit: self.admission.acquire()?,
        })
    }

    /// Lock a transaction's write set, first writer wins.
    pub fn lock_write_set(
        &self,
        keys: rustc_hash::FxHashSet<veri_core::Key>,
    ) -> Result<WriteSetGuard> {
        self.writes.register(keys, self.policy)
    }

    /// Take one parallel-I/O permit (blocks FIFO when exhausted).
    pub fn io_permit(&self) -> Result<IoPermit> {
        Ok(IoPermit {
            _permit: self.io.acquire()?,
        })
    }

    /// Write sets currently held.
    pub fn active_write_sets(&self) -> usize {
        self.writes.active()
    }

    /// Admission slots currently held, for logs.
    pub fn admission_pressure(&self) -> usize {
        self.admission.in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_admission_bounds_concurrency() {
        let coord = Arc::new(Coordinator::new(CoordinatorOptions {
            max_concurrency: 2,
            ..CoordinatorOptions::default()
        }));

        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let coord = Arc::clone(&coord);
            let peak = Arc::clone(&peak);
            let active = Arc::clone(&active);
            handles.push(std::thread::spawn(move || {
                let _guard = coord.admit().unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_waitee_bound_rejects_with_busy() {
        let coord = Coordinator::new(CoordinatorOptions {
            max_concurrency: 1,
            max_waitees: 0,
            ..CoordinatorOptions::default()
        });
        let held = coord.admit().unwrap();
        assert!(matches!(coord.admit(), Err(Error::Busy)));
        drop(held);
        assert!(coord.admit().is_ok());
    }

    #[test]
    fn test_io_permits_bound_parallelism() {
        let coord = Arc::new(Coordinator::new(CoordinatorOptions {
            max_io_concurrency: 3,
            ..CoordinatorOptions::default()
        }));

        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let coord = Arc::clone(&coord);
            let peak = Arc::clone(&peak);
            let active = Arc::clone(&active);
            handles.push(std::thread::spawn(move || {
                let _permit = coord.io_permit().unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(2));
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_conflicts_surface_through_coordinator() {
        let coord = Coordinator::new(CoordinatorOptions::default());
        let keys: rustc_hash::FxHashSet<_> = [veri_core::Key::from("k")].into_iter().collect();
        let _held = coord.lock_write_set(keys.clone()).unwrap();
        assert!(matches!(
            coord.lock_write_set(keys),
            Err(Error::Conflict { .. })
        ));
    }
}
