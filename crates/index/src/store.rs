//! Index persistence
//!
//! Nodes are appended to a per-generation node log; a separate fixed-record
//! commit log marks which node-log root corresponds to which transaction.
//! The index is valid exactly up to its last durable commit record: on
//! reopen the store walks commit records backwards until it finds one whose
//! root node is actually readable, and everything past it is discarded. The
//! chain and value logs are the source of truth, so a discarded index tail
//! is simply re-applied.
//!
//! Compaction writes a fresh generation directory (`nodes-NNNN`) and
//! switches over with a single commit record carrying the new generation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use veri_core::{Error, Result, TxId};
use veri_log::appendlog::{AppendLog, AppendOptions};

use crate::cache::NodeCache;
use crate::node::Node;

/// Serialized payload size of one index commit record.
const COMMIT_PAYLOAD: usize = 20;

/// On-disk size of one framed index commit record.
const COMMIT_RECORD: u64 = (COMMIT_PAYLOAD + veri_log::appendlog::FRAME_OVERHEAD) as u64;

/// Sentinel root offset for a commit with an empty tree.
const EMPTY_ROOT: u64 = u64::MAX;

/// One durable index state: a transaction id and the root that covers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexCommit {
    /// Highest transaction applied to this root.
    pub tx_id: TxId,
    /// Node-log generation the root lives in.
    pub generation: u32,
    /// Root node offset, or `None` for an empty tree.
    pub root: Option<u64>,
}

impl IndexCommit {
    fn to_bytes(self) -> [u8; COMMIT_PAYLOAD] {
        let mut bytes = [0u8; COMMIT_PAYLOAD];
        bytes[0..8].copy_from_slice(&self.tx_id.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.generation.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.root.unwrap_or(EMPTY_ROOT).to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != COMMIT_PAYLOAD {
            return Err(Error::Corrupted(format!(
                "index commit record is {} bytes, expected {}",
                bytes.len(),
                COMMIT_PAYLOAD
            )));
        }
        let root = u64::from_le_bytes(bytes[12..20].try_into().expect("8 bytes"));
        Ok(IndexCommit {
            tx_id: u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes")),
            generation: u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes")),
            root: (root != EMPTY_ROOT).then_some(root),
        })
    }
}

/// Tuning knobs of the node store.
#[derive(Debug, Clone)]
pub struct NodeStoreOptions {
    /// Nodes kept in the in-memory cache.
    pub cache_size: usize,
    /// Write-buffer size of the node log.
    pub flush_buffer_size: usize,
    /// Open read handles per log.
    pub max_open_files: usize,
}

impl Default for NodeStoreOptions {
    fn default() -> Self {
        NodeStoreOptions {
            cache_size: 100_000,
            flush_buffer_size: 4096,
            max_open_files: 10,
        }
    }
}

/// Directory of one node-log generation.
pub fn generation_dir(dir: &Path, generation: u32) -> PathBuf {
    dir.join(format!("nodes-{:04}", generation))
}

fn node_log_options(opts: &NodeStoreOptions) -> AppendOptions {
    AppendOptions {
        // Durability is driven by explicit commit() calls.
        synced: false,
        max_open_files: opts.max_open_files,
        write_buffer_size: opts.flush_buffer_size,
        ..AppendOptions::default()
    }
}

/// Open a bare node log for `generation` (used by compaction to build the
/// next generation before switching over).
pub fn open_generation_log(
    dir: &Path,
    generation: u32,
    opts: &NodeStoreOptions,
) -> Result<AppendLog> {
    AppendLog::open(&generation_dir(dir, generation), node_log_options(opts))
}

/// Persistent store of index nodes plus the commit records tying roots to
/// transaction ids.
pub struct NodeStore {
    dir: PathBuf,
    opts: NodeStoreOptions,
    nodes: RwLock<(u32, AppendLog)>,
    commits: AppendLog,
    cache: NodeCache,
}

impl NodeStore {
    /// Open (or create) the index store in `dir`.
    pub fn open(dir: &Path, opts: NodeStoreOptions) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let commits = AppendLog::open(
            &dir.join("commits"),
            AppendOptions {
                synced: false,
                max_open_files: opts.max_open_files,
                ..AppendOptions::default()
            },
        )?;

        // Drop a torn record at the tail.
        let torn = commits.tail() % COMMIT_RECORD;
        if torn != 0 {
            warn!(dropped = torn, "dropping torn index commit record");
            commits.truncate_tail(commits.tail() - torn)?;
        }

        let mut store = NodeStore {
            dir: dir.to_path_buf(),
            cache: NodeCache::new(opts.cache_size),
            nodes: RwLock::new((0, open_generation_log(dir, 1, &opts)?)),
            commits,
            opts,
        };
        store.recover()?;
        store.remove_stray_generations()?;
        Ok(store)
    }

    /// Walk commit records backwards until one with a readable root is
    /// found; drop everything after it.
    fn recover(&mut self) -> Result<()> {
        loop {
            let count = self.commits.tail() / COMMIT_RECORD;
            let Some(last) = count.checked_sub(1) else {
                // Empty commit log: fresh generation 1.
                *self.nodes.get_mut() = (1, open_generation_log(&self.dir, 1, &self.opts)?);
                return Ok(());
            };
            match self.read_commit_slot(last) {
                Ok(commit) => {
                    let log = open_generation_log(&self.dir, commit.generation, &self.opts)?;
                    let readable = match commit.root {
                        None => true,
                        Some(root) => {
                            root < log.tail()
                                && log
                                    .read_record(root)
                                    .and_then(|b| Node::from_bytes(&b))
                                    .is_ok()
                        }
                    };
                    if readable {
                        *self.nodes.get_mut() = (commit.generation, log);
                        return Ok(());
                    }
                    warn!(
                        tx_id = commit.tx_id,
                        "index commit points at unreadable root, discarding"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "unreadable index commit record, discarding");
                }
            }
            self.commits.truncate_tail(last * COMMIT_RECORD)?;
        }
    }

    fn remove_stray_generations(&self) -> Result<()> {
        let current = self.nodes.read().0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(gen) = name.strip_prefix("nodes-").and_then(|g| g.parse::<u32>().ok()) {
                if gen != current {
                    info!(generation = gen, "removing stray index generation");
                    std::fs::remove_dir_all(entry.path())?;
                }
            }
        }
        Ok(())
    }

    fn read_commit_slot(&self, slot: u64) -> Result<IndexCommit> {
        let payload = self.commits.read_record(slot * COMMIT_RECORD)?;
        IndexCommit::from_bytes(&payload)
    }

    /// The most recent durable commit, if any.
    pub fn last_commit(&self) -> Result<Option<IndexCommit>> {
        match (self.commits.tail() / COMMIT_RECORD).checked_sub(1) {
            Some(slot) => Ok(Some(self.read_commit_slot(slot)?)),
            None => Ok(None),
        }
    }

    /// Highest transaction id the durable index covers, 0 when empty.
    pub fn indexed_up_to(&self) -> Result<TxId> {
        Ok(self.last_commit()?.map(|c| c.tx_id).unwrap_or(0))
    }

    /// Current node-log generation.
    pub fn generation(&self) -> u32 {
        self.nodes.read().0
    }

    /// Append a serialized node, returning its offset.
    pub fn append_node(&self, node: &Node) -> Result<u64> {
        let bytes = node.to_bytes()?;
        self.nodes.read().1.append(&bytes)
    }

    /// Read the node at `offset`, consulting the cache first.
    pub fn read_node(&self, offset: u64) -> Result<Arc<Node>> {
        if let Some(node) = self.cache.get(offset) {
            return Ok(node);
        }
        let bytes = self.nodes.read().1.read_record(offset)?;
        let node = Arc::new(Node::from_bytes(&bytes)?);
        self.cache.put(offset, Arc::clone(&node));
        Ok(node)
    }

    /// Record that the tree rooted at `root` covers transactions up to
    /// `tx_id`. With `sync`, both logs are made durable first.
    pub fn commit(&self, tx_id: TxId, root: Option<u64>, sync: bool) -> Result<()> {
        let generation = {
            let nodes = self.nodes.read();
            if sync {
                nodes.1.sync()?;
            } else {
                nodes.1.flush()?;
            }
            nodes.0
        };
        let record = IndexCommit {
            tx_id,
            generation,
            root,
        };
        self.commits.append(&record.to_bytes())?;
        if sync {
            self.commits.sync()?;
        } else {
            self.commits.flush()?;
        }
        Ok(())
    }

    /// Switch to a freshly built generation (compaction handover).
    ///
    /// The new generation's node log must already be fully written and
    /// synced. The old generation directory is removed after the commit
    /// record that references the new one is durable.
    pub fn switch_generation(&self, generation: u32, tx_id: TxId, root: Option<u64>) -> Result<()> {
        let log = open_generation_log(&self.dir, generation, &self.opts)?;
        let old = {
            let mut nodes = self.nodes.write();
            let old = nodes.0;
            *nodes = (generation, log);
            old
        };
        self.cache.clear();

        let record = IndexCommit {
            tx_id,
            generation,
            root,
        };
        self.commits.append(&record.to_bytes())?;
        self.commits.sync()?;

        std::fs::remove_dir_all(generation_dir(&self.dir, old))?;
        info!(from = old, to = generation, "index generation switched");
        Ok(())
    }

    /// Store options (shared with the compactor).
    pub fn options(&self) -> &NodeStoreOptions {
        &self.opts
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes appended to the current node log.
    pub fn node_log_size(&self) -> u64 {
        self.nodes.read().1.tail()
    }
}
