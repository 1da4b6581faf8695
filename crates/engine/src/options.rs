//! Engine configuration
//!
//! All knobs are validated up front by [`Options::validate`]; a store never
//! opens with an inconsistent configuration.

use std::time::Duration;

use veri_concurrency::ConflictPolicy;
use veri_core::{Error, Limits, Result, MAX_KEY_LEN, MAX_PARALLEL_IO};
use veri_log::appendlog::Compression;

/// Index-specific tuning.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Nodes kept in the in-memory cache.
    pub cache_size: usize,
    /// Transactions between index flushes.
    pub flush_thld: u64,
    /// Transactions between durable (fsynced) index flushes.
    pub sync_thld: u64,
    /// Write-buffer size of the node log.
    pub flush_buffer_size: usize,
    /// Outstanding snapshots allowed.
    pub max_active_snapshots: usize,
    /// Maximum entries (or children) per tree node.
    pub max_node_size: usize,
    /// Age after which a cached read snapshot is replaced.
    pub renew_snap_root_after: Duration,
    /// Stale versions that make compaction worthwhile.
    pub compaction_thld: u64,
    /// Per-node pause while compacting, to throttle I/O.
    pub delay_during_compaction: Duration,
}

impl Default for IndexOptions {
    fn default() -> Self {
        IndexOptions {
            cache_size: 100_000,
            flush_thld: 100_000,
            sync_thld: 1_000_000,
            flush_buffer_size: 4096,
            max_active_snapshots: 100,
            max_node_size: veri_index::DEFAULT_MAX_NODE_SIZE,
            renew_snap_root_after: Duration::from_millis(1000),
            compaction_thld: 100_000,
            delay_during_compaction: Duration::from_millis(0),
        }
    }
}

impl IndexOptions {
    /// Validate the option combination.
    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            return Err(Error::InvalidConfig("index cache_size must be > 0".into()));
        }
        if self.flush_thld == 0 || self.sync_thld == 0 {
            return Err(Error::InvalidConfig(
                "index flush_thld and sync_thld must be > 0".into(),
            ));
        }
        if self.flush_thld > self.sync_thld {
            return Err(Error::InvalidConfig(
                "index flush_thld cannot exceed sync_thld".into(),
            ));
        }
        if self.flush_buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "index flush_buffer_size must be > 0".into(),
            ));
        }
        if self.max_active_snapshots == 0 {
            return Err(Error::InvalidConfig(
                "index max_active_snapshots must be > 0".into(),
            ));
        }
        if self.max_node_size < 2 {
            return Err(Error::InvalidConfig(
                "index max_node_size must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Transactions allowed in the commit pipeline at once.
    pub max_concurrency: usize,
    /// Parallel value-log appends per commit batch.
    pub max_io_concurrency: usize,
    /// Per-transaction entry/key/value limits.
    pub limits: Limits,
    /// Longest chain span a linear proof may cover.
    pub max_linear_proof_len: u64,
    /// Queued transactions before admission fails with `Busy`.
    pub max_waitees: usize,
    /// Behavior when two in-flight write sets overlap.
    pub conflict_policy: ConflictPolicy,
    /// Maximum data bytes per segment file.
    pub file_size: u64,
    /// Open read handles per log.
    pub max_opened_files: usize,
    /// fsync every commit (durable on return) vs buffered.
    pub synced: bool,
    /// Open for reads only.
    pub read_only: bool,
    /// Value-log compression.
    pub compression: Compression,
    /// Index tuning.
    pub index: IndexOptions,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            max_concurrency: 30,
            max_io_concurrency: 1,
            limits: Limits::default(),
            max_linear_proof_len: 1024,
            max_waitees: 1000,
            conflict_policy: ConflictPolicy::default(),
            file_size: 1 << 29,
            max_opened_files: 10,
            synced: true,
            read_only: false,
            compression: Compression::None,
            index: IndexOptions::default(),
        }
    }
}

impl Options {
    /// Validate the full configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::InvalidConfig("max_concurrency must be > 0".into()));
        }
        if self.max_io_concurrency == 0 || self.max_io_concurrency > MAX_PARALLEL_IO {
            return Err(Error::InvalidConfig(format!(
                "max_io_concurrency must be in 1..={}",
                MAX_PARALLEL_IO
            )));
        }
        if self.limits.max_key_len > MAX_KEY_LEN {
            return Err(Error::InvalidConfig(format!(
                "max_key_len cannot exceed {}",
                MAX_KEY_LEN
            )));
        }
        self.limits.validate()?;
        if self.max_linear_proof_len == 0 {
            return Err(Error::InvalidConfig(
                "max_linear_proof_len must be > 0".into(),
            ));
        }
        if self.max_opened_files == 0 {
            return Err(Error::InvalidConfig("max_opened_files must be > 0".into()));
        }
        self.index.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn test_io_concurrency_bounds() {
        let mut opts = Options::default();
        opts.max_io_concurrency = 0;
        assert!(opts.validate().is_err());
        opts.max_io_concurrency = MAX_PARALLEL_IO + 1;
        assert!(opts.validate().is_err());
        opts.max_io_concurrency = MAX_PARALLEL_IO;
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_key_len_ceiling() {
        let mut opts = Options::default();
        opts.limits.max_key_len = MAX_KEY_LEN + 1;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_index_thresholds() {
        let mut opts = IndexOptions::default();
        opts.flush_thld = opts.sync_thld + 1;
        assert!(opts.validate().is_err());
    }
}
