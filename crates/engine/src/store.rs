//! The storage engine
//!
//! Ties the pieces together: value, transaction, and commit logs; the hash
//! chain and Merkle accumulator; the versioned index; and the commit
//! coordinator.
//!
//! # Commit Pipeline
//!
//! ```text
//! validate -> admit -> lock write set -> append values (parallel)
//!          -> [chain lock] append tx record, commit header, advance alh
//!          -> [index lock] apply entries
//! ```
//!
//! The chain lock is the serialization point: transaction ids, the
//! accumulator, and the accumulated linear hash all advance under it, so
//! the chain is total-ordered no matter how many transactions are in
//! flight. A transaction is durable exactly when its commit header is.

use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, info};

use veri_concurrency::{Coordinator, CoordinatorOptions};
use veri_core::{CommitPhase, Digest, Error, Key, Result, TxEntry, TxId};
use veri_index::{
    compact, NodeStoreOptions, Snapshot as IndexSnapshot, SnapshotRegistry, Tree,
};
use veri_log::appendlog::AppendOptions;
use veri_log::{
    chain, CommitLog, ConsistencyProof, HeaderBinding, InclusionProof, LinearStep,
    MerkleAccumulator, Offloader, RemoteStorage, TxHeader, TxLog, ValueLog,
};

use crate::options::Options;
use crate::recovery;
use crate::transaction::Transaction;

struct ChainState {
    acc: MerkleAccumulator,
    head_id: TxId,
    head_alh: Digest,
}

struct IndexState {
    tree: Tree,
    since_flush: u64,
    since_sync: u64,
}

struct CachedSnapshot {
    snap: Arc<IndexSnapshot>,
    taken: Instant,
}

/// A tamper-evident embedded key-value store.
pub struct Store {
    opts: Options,
    vlog: ValueLog,
    txlog: TxLog,
    clog: CommitLog,
    chain: Mutex<ChainState>,
    index: Mutex<IndexState>,
    /// Highest transaction applied to the in-memory index.
    applied: AtomicU64,
    snapshots: SnapshotRegistry,
    coordinator: Coordinator,
    cached: Mutex<Option<CachedSnapshot>>,
    dir: PathBuf,
}

impl Store {
    /// Open (or create) a store rooted at `dir`.
    pub fn open(dir: &Path, opts: Options) -> Result<Self> {
        opts.validate()?;
        std::fs::create_dir_all(dir)?;

        let log_opts = |compression| AppendOptions {
            file_size: opts.file_size,
            synced: false, // the commit pipeline syncs explicitly
            max_open_files: opts.max_opened_files,
            compression,
            read_only: opts.read_only,
            ..AppendOptions::default()
        };
        let vlog = ValueLog::open(&dir.join("vlog"), log_opts(opts.compression))?;
        let txlog = TxLog::open(&dir.join("tx"), log_opts(Default::default()))?;
        let clog = CommitLog::open(&dir.join("commit"), log_opts(Default::default()))?;

        let state = recovery::rebuild_chain(&clog, opts.read_only)?;

        let mut tree = recovery::open_index(
            &dir.join("index"),
            NodeStoreOptions {
                cache_size: opts.index.cache_size,
                flush_buffer_size: opts.index.flush_buffer_size,
                max_open_files: opts.max_opened_files,
            },
            opts.index.max_node_size,
            state.head_id,
            opts.read_only,
        )?;
        let caught_up = recovery::catch_up_index(&mut tree, &clog, &txlog)?;
        if caught_up > 0 && !opts.read_only {
            tree.flush(true)?;
        }

        info!(
            dir = %dir.display(),
            head = state.head_id,
            read_only = opts.read_only,
            "store opened"
        );

        Ok(Store {
            coordinator: Coordinator::new(CoordinatorOptions {
                max_concurrency: opts.max_concurrency,
                max_io_concurrency: opts.max_io_concurrency,
                max_waitees: opts.max_waitees,
                conflict_policy: opts.conflict_policy,
            }),
            snapshots: SnapshotRegistry::new(opts.index.max_active_snapshots),
            applied: AtomicU64::new(tree.indexed_up_to()),
            chain: Mutex::new(ChainState {
                acc: state.acc,
                head_id: state.head_id,
                head_alh: state.head_alh,
            }),
            index: Mutex::new(IndexState {
                tree,
                since_flush: 0,
                since_sync: 0,
            }),
            cached: Mutex::new(None),
            vlog,
            txlog,
            clog,
            opts,
            dir: dir.to_path_buf(),
        })
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Id and accumulated linear hash of the newest committed transaction.
    /// Id 0 with the all-zero digest means the store is empty.
    pub fn commit_state(&self) -> (TxId, Digest) {
        let state = self.chain.lock();
        (state.head_id, state.head_alh)
    }

    /// Start building a transaction. Dropping it without committing aborts
    /// it; nothing was reserved.
    pub fn begin(&self) -> Transaction {
        Transaction::new()
    }

    /// Commit a transaction, returning its durable header.
    ///
    /// An `Err` tagged [`CommitPhase::Indexed`] means the transaction IS
    /// durable; only the index application failed, and reopening the store
    /// will redo it.
    pub fn commit(&self, tx: Transaction) -> Result<TxHeader> {
        if self.opts.read_only {
            return Err(Error::ReadOnly);
        }
        tx.validate(&self.opts.limits)?;

        let _admission = self.coordinator.admit()?;
        let _write_set = self.coordinator.lock_write_set(tx.key_set())?;

        // Value appends can run in parallel; everything after the chain
        // lock is strictly serial.
        let entries = self
            .append_values(&tx)
            .map_err(|e| e.in_phase(0, CommitPhase::Admitted))?;

        let header = {
            let mut state = self.chain.lock();
            let id = state.head_id + 1;
            let ts = now_millis();
            let eh = chain::entries_digest(&entries);
            let inner = chain::inner_hash(id, ts, &eh);
            state.acc.append(inner);
            let root = state.acc.root();
            let alh = chain::alh(&state.head_alh, &inner, &root);

            let logged = (|| -> Result<TxHeader> {
                let (tx_off, tx_len) = self.txlog.append(id, &entries)?;
                if self.opts.synced {
                    // Values and entry lists must be durable before the
                    // commit record that makes them reachable.
                    self.vlog.sync()?;
                    self.txlog.sync()?;
                }
                let header = TxHeader {
                    id,
                    ts,
                    nentries: entries.len() as u32,
                    tx_off,
                    tx_len,
                    eh,
                    prev_alh: state.head_alh,
                    alh,
                };
                self.clog.append_header(&header)?;
                if self.opts.synced {
                    self.clog.sync()?;
                }
                Ok(header)
            })();
            match logged {
                Ok(header) => {
                    state.head_id = id;
                    state.head_alh = alh;
                    header
                }
                Err(e) => {
                    state.acc.truncate(id - 1);
                    return Err(e.in_phase(id, CommitPhase::Logged));
                }
            }
        };

        self.apply_to_index(header.id, &entries)
            .map_err(|e| e.in_phase(header.id, CommitPhase::Indexed))?;
        debug!(tx_id = header.id, entries = header.nentries, "committed");
        Ok(header)
    }

    fn append_values(&self, tx: &Transaction) -> Result<Vec<TxEntry>> {
        if self.opts.max_io_concurrency > 1 && tx.writes.len() > 1 {
            tx.writes
                .par_iter()
                .map(|w| {
                    let _permit = self.coordinator.io_permit()?;
                    let vref = self.vlog.append_value(&w.value)?;
                    Ok(TxEntry::new(w.key.clone(), vref, w.meta))
                })
                .collect()
        } else {
            tx.writes
                .iter()
                .map(|w| {
                    let vref = self.vlog.append_value(&w.value)?;
                    Ok(TxEntry::new(w.key.clone(), vref, w.meta))
                })
                .collect()
        }
    }

    fn apply_to_index(&self, id: TxId, entries: &[TxEntry]) -> Result<()> {
        let mut index = self.index.lock();
        index.tree.apply(id, entries)?;
        self.applied.store(id, Ordering::SeqCst);
        index.since_flush += 1;
        index.since_sync += 1;
        if index.since_sync >= self.opts.index.sync_thld {
            index.tree.flush(true)?;
            index.since_sync = 0;
            index.since_flush = 0;
        } else if index.since_flush >= self.opts.index.flush_thld {
            index.tree.flush(false)?;
            index.since_flush = 0;
        }
        Ok(())
    }

    /// A read snapshot of the current index state, reusing the cached one
    /// while it is both current and younger than `renew_snap_root_after`.
    fn read_snapshot(&self) -> Arc<IndexSnapshot> {
        let applied = self.applied.load(Ordering::SeqCst);
        {
            let cached = self.cached.lock();
            if let Some(c) = cached.as_ref() {
                if c.snap.tx_id() == applied
                    && c.taken.elapsed() < self.opts.index.renew_snap_root_after
                {
                    return Arc::clone(&c.snap);
                }
            }
        }
        let snap = Arc::new(self.index.lock().tree.snapshot());
        *self.cached.lock() = Some(CachedSnapshot {
            snap: Arc::clone(&snap),
            taken: Instant::now(),
        });
        snap
    }

    /// Latest value of `key`, or `None` if absent or deleted.
    pub fn get(&self, key: &Key) -> Result<Option<(TxId, Vec<u8>)>> {
        let snap = self.read_snapshot();
        self.resolve(snap.get(key)?)
    }

    /// Value of `key` as of transaction `up_to`.
    pub fn get_at(&self, key: &Key, up_to: TxId) -> Result<Option<(TxId, Vec<u8>)>> {
        let snap = self.read_snapshot();
        self.resolve(snap.get_at(key, up_to)?)
    }

    fn resolve(&self, version: Option<veri_index::Version>) -> Result<Option<(TxId, Vec<u8>)>> {
        match version {
            None => Ok(None),
            Some(v) if v.meta.is_deleted() => Ok(None),
            Some(v) => Ok(Some((v.tx_id, self.vlog.read_value(&v.value_ref)?))),
        }
    }

    /// Full write history of `key`, ascending; `None` values are deletions.
    pub fn history(&self, key: &Key) -> Result<Vec<(TxId, Option<Vec<u8>>)>> {
        let snap = self.read_snapshot();
        let mut out = Vec::new();
        for v in snap.history(key)? {
            if v.meta.is_deleted() {
                out.push((v.tx_id, None));
            } else {
                out.push((v.tx_id, Some(self.vlog.read_value(&v.value_ref)?)));
            }
        }
        Ok(out)
    }

    /// Keys in range with their latest live values, ascending, at most
    /// `limit` results.
    pub fn scan(
        &self,
        start: Bound<&Key>,
        end: Bound<&Key>,
        limit: usize,
    ) -> Result<Vec<(Key, TxId, Vec<u8>)>> {
        let snap = self.read_snapshot();
        let mut out = Vec::new();
        for (key, v) in snap.scan(start, end, limit)? {
            out.push((key, v.tx_id, self.vlog.read_value(&v.value_ref)?));
        }
        Ok(out)
    }

    /// Take a pinned snapshot: a stable read view that counts against the
    /// outstanding-snapshot bound and blocks index compaction while held.
    pub fn snapshot(&self) -> Result<StoreSnapshot<'_>> {
        let guard = self.snapshots.acquire()?;
        let snap = self.index.lock().tree.snapshot().with_guard(guard);
        Ok(StoreSnapshot { store: self, snap })
    }

    /// Durable header of transaction `id`.
    pub fn tx_header(&self, id: TxId) -> Result<TxHeader> {
        self.clog.read_header(id)
    }

    /// Entry list of transaction `id`.
    pub fn tx_entries(&self, id: TxId) -> Result<Vec<TxEntry>> {
        let header = self.clog.read_header(id)?;
        self.txlog.read(header.tx_off, id)
    }

    /// Value bytes of one transaction entry.
    pub fn entry_value(&self, entry: &TxEntry) -> Result<Vec<u8>> {
        self.vlog.read_value(&entry.value_ref)
    }

    fn check_span(&self, tx_id: TxId, target_id: TxId, head: TxId) -> Result<()> {
        if tx_id == 0 || tx_id > target_id || target_id > head {
            return Err(Error::InvalidArgument(format!(
                "proof span {}..{} outside committed range 1..={}",
                tx_id, target_id, head
            )));
        }
        Ok(())
    }

    fn binding(&self, acc: &MerkleAccumulator, id: TxId) -> Result<HeaderBinding> {
        let header = self.clog.read_header(id)?;
        Ok(HeaderBinding {
            prev_alh: header.prev_alh,
            inner: header.inner(),
            root: acc.root_at(id)?,
        })
    }

    /// Logarithmic proof that `tx_id` is part of the history ending at
    /// `target_id`.
    pub fn inclusion_proof(&self, tx_id: TxId, target_id: TxId) -> Result<InclusionProof> {
        let state = self.chain.lock();
        self.check_span(tx_id, target_id, state.head_id)?;
        Ok(InclusionProof::Logarithmic {
            target: self.binding(&state.acc, target_id)?,
            path: state.acc.inclusion_path(tx_id - 1, target_id)?,
        })
    }

    /// Linear proof of the same statement; the span is capped by
    /// `max_linear_proof_len`.
    pub fn linear_inclusion_proof(&self, tx_id: TxId, target_id: TxId) -> Result<InclusionProof> {
        let state = self.chain.lock();
        self.check_span(tx_id, target_id, state.head_id)?;
        self.check_linear_span(tx_id, target_id)?;
        Ok(InclusionProof::Linear {
            source: self.binding(&state.acc, tx_id)?,
            steps: self.linear_steps(&state.acc, tx_id, target_id)?,
        })
    }

    /// Logarithmic proof that the history at `old_id` is a prefix of the
    /// history at `new_id`.
    pub fn consistency_proof(&self, old_id: TxId, new_id: TxId) -> Result<ConsistencyProof> {
        let state = self.chain.lock();
        self.check_span(old_id, new_id, state.head_id)?;
        Ok(ConsistencyProof::Logarithmic {
            old: self.binding(&state.acc, old_id)?,
            new: self.binding(&state.acc, new_id)?,
            path: state.acc.consistency_path(old_id, new_id)?,
        })
    }

    /// Linear proof of the same statement; the span is capped by
    /// `max_linear_proof_len`.
    pub fn linear_consistency_proof(&self, old_id: TxId, new_id: TxId) -> Result<ConsistencyProof> {
        let state = self.chain.lock();
        self.check_span(old_id, new_id, state.head_id)?;
        self.check_linear_span(old_id, new_id)?;
        Ok(ConsistencyProof::Linear {
            old: self.binding(&state.acc, old_id)?,
            steps: self.linear_steps(&state.acc, old_id, new_id)?,
        })
    }

    fn check_linear_span(&self, from: TxId, to: TxId) -> Result<()> {
        if to - from > self.opts.max_linear_proof_len {
            return Err(Error::InvalidArgument(format!(
                "linear proof span {} exceeds maximum {}",
                to - from,
                self.opts.max_linear_proof_len
            )));
        }
        Ok(())
    }

    fn linear_steps(
        &self,
        acc: &MerkleAccumulator,
        from_excl: TxId,
        to_incl: TxId,
    ) -> Result<Vec<LinearStep>> {
        (from_excl + 1..=to_incl)
            .map(|id| {
                let header = self.clog.read_header(id)?;
                Ok(LinearStep {
                    inner: header.inner(),
                    root: acc.root_at(id)?,
                })
            })
            .collect()
    }

    /// Re-verify the whole chain from disk. With `full`, every
    /// transaction's entry list is read back and checked against its
    /// digest too. Returns the verified head.
    pub fn verify_chain(&self, full: bool) -> Result<TxId> {
        let head = self.commit_state().0;
        let mut acc = MerkleAccumulator::new();
        let mut prev_alh = veri_core::NULL_DIGEST;
        for id in 1..=head {
            let header = self.clog.read_header(id)?;
            if full {
                let entries = self.txlog.read(header.tx_off, id)?;
                if chain::entries_digest(&entries) != header.eh {
                    return Err(Error::Corrupted(format!(
                        "entry list of transaction {} does not match its digest",
                        id
                    )));
                }
            }
            let inner = header.inner();
            acc.append(inner);
            let expected = chain::alh(&prev_alh, &inner, &acc.root());
            if header.prev_alh != prev_alh || header.alh != expected {
                return Err(Error::Corrupted(format!(
                    "hash chain mismatch at transaction {}",
                    id
                )));
            }
            prev_alh = expected;
        }
        Ok(head)
    }

    /// Rewrite the index into a fresh generation, reclaiming space held by
    /// superseded node versions. Fails with [`Error::Busy`] while pinned
    /// snapshots are outstanding. Point reads racing the generation switch
    /// can fail once and should be retried; run this at a quiet point.
    pub fn compact_index(&self) -> Result<u64> {
        if self.opts.read_only {
            return Err(Error::ReadOnly);
        }
        let mut index = self.index.lock();
        if self.snapshots.active() > 0 {
            return Err(Error::Busy);
        }
        // The cached read snapshot references the generation about to be
        // deleted.
        *self.cached.lock() = None;
        compact(&mut index.tree, self.opts.index.delay_during_compaction)
    }

    /// Stale versions accumulated since the last compaction, against the
    /// configured threshold.
    pub fn compaction_pressure(&self) -> (u64, u64) {
        (
            self.index.lock().tree.stale_versions(),
            self.opts.index.compaction_thld,
        )
    }

    /// Route cold-segment archival of the value and transaction logs to a
    /// remote backend. The commit log stays local: its O(1) id lookup is
    /// on every read path.
    pub fn attach_remote(&self, storage: Arc<dyn RemoteStorage>, prefix: &str) {
        self.vlog
            .set_offloader(Offloader::new(Arc::clone(&storage), format!("{}/vlog", prefix)));
        self.txlog
            .set_offloader(Offloader::new(storage, format!("{}/tx", prefix)));
    }

    /// Upload sealed value/transaction segments and replace them with
    /// stubs. Returns the number of segments offloaded.
    pub fn offload_cold_segments(&self) -> Result<usize> {
        if self.opts.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(self.vlog.offload_sealed()? + self.txlog.offload_sealed()?)
    }

    /// Make everything durable: logs and index.
    pub fn sync(&self) -> Result<()> {
        if self.opts.read_only {
            return Ok(());
        }
        self.vlog.sync()?;
        self.txlog.sync()?;
        self.clog.sync()?;
        let mut index = self.index.lock();
        index.tree.flush(true)?;
        index.since_flush = 0;
        index.since_sync = 0;
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A pinned, stable read view of the store.
pub struct StoreSnapshot<'a> {
    store: &'a Store,
    snap: IndexSnapshot,
}

impl StoreSnapshot<'_> {
    /// Transaction id this snapshot covers.
    pub fn tx_id(&self) -> TxId {
        self.snap.tx_id()
    }

    /// Latest value of `key` at this snapshot.
    pub fn get(&self, key: &Key) -> Result<Option<(TxId, Vec<u8>)>> {
        self.store.resolve(self.snap.get(key)?)
    }

    /// Value of `key` as of transaction `up_to` (clamped to the snapshot).
    pub fn get_at(&self, key: &Key, up_to: TxId) -> Result<Option<(TxId, Vec<u8>)>> {
        self.store.resolve(self.snap.get_at(key, up_to)?)
    }

    /// Range scan at this snapshot.
    pub fn scan(
        &self,
        start: Bound<&Key>,
        end: Bound<&Key>,
        limit: usize,
    ) -> Result<Vec<(Key, TxId, Vec<u8>)>> {
        let mut out = Vec::new();
        for (key, v) in self.snap.scan(start, end, limit)? {
            out.push((key, v.tx_id, self.store.vlog.read_value(&v.value_ref)?));
        }
        Ok(out)
    }
}
