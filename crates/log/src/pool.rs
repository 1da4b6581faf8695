//! Bounded FIFO pool of read file handles
//!
//! Each appendable log keeps at most `max_open` files open for reading.
//! Readers beyond the bound block until a handle is released; admission is
//! ticket-ordered so a stream of fast readers cannot starve a slow one.

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};

use parking_lot::{Condvar, Mutex};

use veri_core::{Error, Result};

use crate::segment::segment_path;

struct PoolState {
    /// Idle open handles, keyed by segment number.
    idle: VecDeque<(u32, File)>,
    /// Handles currently open (idle + lent out).
    open_count: usize,
    /// Next ticket to hand out.
    next_ticket: u64,
    /// Ticket currently allowed to acquire.
    now_serving: u64,
}

/// FIFO-admission pool of read handles over one log directory.
pub struct HandlePool {
    dir: PathBuf,
    max_open: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl HandlePool {
    /// Create a pool over `dir` with at most `max_open` open handles.
    pub fn new(dir: &Path, max_open: usize) -> Self {
        HandlePool {
            dir: dir.to_path_buf(),
            max_open: max_open.max(1),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                open_count: 0,
                next_ticket: 0,
                now_serving: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Run `f` with a read handle for `segment`, blocking FIFO if the pool
    /// is exhausted. The handle is returned to the pool afterwards, even if
    /// `f` fails.
    pub fn with_handle<T>(
        &self,
        segment: u32,
        f: impl FnOnce(&mut File) -> Result<T>,
    ) -> Result<T> {
        let mut file = self.acquire(segment)?;
        let result = f(&mut file);
        self.release(segment, file, result.is_ok());
        result
    }

    fn acquire(&self, segment: u32) -> Result<File> {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        while state.now_serving != ticket || state.open_count >= self.max_open {
            // A matching idle handle frees no capacity but satisfies us
            // immediately once it is our turn.
            if state.now_serving == ticket {
                if let Some(pos) = state.idle.iter().position(|(n, _)| *n == segment) {
                    let (_, file) = state.idle.remove(pos).unwrap();
                    state.now_serving += 1;
                    self.available.notify_all();
                    return Ok(file);
                }
                if state.open_count < self.max_open {
                    break;
                }
                // Full, but an idle handle of another segment can be evicted.
                if let Some((_, file)) = state.idle.pop_front() {
                    drop(file);
                    state.open_count -= 1;
                    break;
                }
            }
            self.available.wait(&mut state);
        }

        // Our turn, with capacity for a fresh handle.
        if let Some(pos) = state.idle.iter().position(|(n, _)| *n == segment) {
            let (_, file) = state.idle.remove(pos).unwrap();
            state.now_serving += 1;
            self.available.notify_all();
            return Ok(file);
        }
        state.open_count += 1;
        state.now_serving += 1;
        self.available.notify_all();
        drop(state);

        match File::open(segment_path(&self.dir, segment)) {
            Ok(file) => Ok(file),
            Err(e) => {
                let mut state = self.state.lock();
                state.open_count -= 1;
                self.available.notify_all();
                Err(Error::from(e))
            }
        }
    }

    fn release(&self, segment: u32, file: File, reusable: bool) {
        let mut state = self.state.lock();
        if reusable {
            state.idle.push_back((segment, file));
        } else {
            // A failed read may have left the handle mid-seek; drop it.
            drop(file);
            state.open_count -= 1;
        }
        self.available.notify_all();
    }

    /// Drop any idle handle for `segment` (called before a segment file is
    /// replaced by an offload stub).
    pub fn evict(&self, segment: u32) {
        let mut state = self.state.lock();
        while let Some(pos) = state.idle.iter().position(|(n, _)| *n == segment) {
            state.idle.remove(pos);
            state.open_count -= 1;
        }
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn make_segment(dir: &Path, number: u32) {
        let mut seg = Segment::create(dir, number, 0).unwrap();
        seg.write(format!("segment-{}", number).as_bytes()).unwrap();
        seg.sync().unwrap();
    }

    #[test]
    fn test_handle_reuse() {
        let dir = tempdir().unwrap();
        make_segment(dir.path(), 1);

        let pool = HandlePool::new(dir.path(), 2);
        for _ in 0..5 {
            pool.with_handle(1, |f| {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)?;
                assert!(!buf.is_empty());
                Ok(())
            })
            .unwrap();
        }
    }

    #[test]
    fn test_missing_segment_is_io_error() {
        let dir = tempdir().unwrap();
        let pool = HandlePool::new(dir.path(), 2);
        assert!(pool.with_handle(99, |_| Ok(())).is_err());
    }

    #[test]
    fn test_pool_bounds_concurrent_opens() {
        let dir = tempdir().unwrap();
        for n in 1..=4 {
            make_segment(dir.path(), n);
        }

        let pool = Arc::new(HandlePool::new(dir.path(), 2));
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let pool = Arc::clone(&pool);
            let peak = Arc::clone(&peak);
            let active = Arc::clone(&active);
            handles.push(std::thread::spawn(move || {
                pool.with_handle((i % 4) + 1, |_| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_evict_closes_idle_handles() {
        let dir = tempdir().unwrap();
        make_segment(dir.path(), 1);

        let pool = HandlePool::new(dir.path(), 1);
        pool.with_handle(1, |_| Ok(())).unwrap();
        pool.evict(1);
        // Pool still works after eviction.
        pool.with_handle(1, |_| Ok(())).unwrap();
    }
}
