//! Size limits for transactions, keys, and values
//!
//! Limits are enforced before any I/O; violations surface as
//! `InvalidArgument`. Defaults match the values persisted as store metadata
//! at creation time, so reopening a store with different limits is a
//! configuration error, not a silent behavior change.

use crate::error::{Error, Result};
use crate::types::Key;

/// Hard ceiling on the configurable maximum key length.
pub const MAX_KEY_LEN: usize = 1024;

/// Hard ceiling on concurrent I/O workers.
pub const MAX_PARALLEL_IO: usize = 127;

/// Hard ceiling on segment file size (just under 2 GiB).
pub const MAX_FILE_SIZE: u64 = (1 << 31) - 1;

/// Default maximum entries per transaction.
pub const DEFAULT_MAX_TX_ENTRIES: usize = 1 << 10;

/// Default maximum key length in bytes.
pub const DEFAULT_MAX_KEY_LEN: usize = 1024;

/// Default maximum value length in bytes.
pub const DEFAULT_MAX_VALUE_LEN: usize = 4096;

/// Per-store size limits.
///
/// Enforced by the engine on every write before the transaction touches the
/// coordinator or the logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum entries per transaction.
    pub max_tx_entries: usize,
    /// Maximum key length in bytes. Must not exceed [`MAX_KEY_LEN`].
    pub max_key_len: usize,
    /// Maximum value length in bytes.
    pub max_value_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_tx_entries: DEFAULT_MAX_TX_ENTRIES,
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
        }
    }
}

impl Limits {
    /// Check that the limit combination itself is valid.
    pub fn validate(&self) -> Result<()> {
        if self.max_tx_entries == 0 {
            return Err(Error::InvalidConfig("max_tx_entries must be > 0".into()));
        }
        if self.max_key_len == 0 || self.max_key_len > MAX_KEY_LEN {
            return Err(Error::InvalidConfig(format!(
                "max_key_len must be in 1..={}",
                MAX_KEY_LEN
            )));
        }
        if self.max_value_len == 0 {
            return Err(Error::InvalidConfig("max_value_len must be > 0".into()));
        }
        Ok(())
    }

    /// Validate a key against the configured bound.
    pub fn validate_key(&self, key: &Key) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".into()));
        }
        if key.len() > self.max_key_len {
            return Err(Error::InvalidArgument(format!(
                "key length {} exceeds maximum {}",
                key.len(),
                self.max_key_len
            )));
        }
        Ok(())
    }

    /// Validate a value against the configured bound.
    pub fn validate_value(&self, value: &[u8]) -> Result<()> {
        if value.len() > self.max_value_len {
            return Err(Error::InvalidArgument(format!(
                "value length {} exceeds maximum {}",
                value.len(),
                self.max_value_len
            )));
        }
        Ok(())
    }

    /// Validate the entry count of a transaction.
    pub fn validate_entry_count(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidArgument("empty transaction".into()));
        }
        if count > self.max_tx_entries {
            return Err(Error::InvalidArgument(format!(
                "{} entries exceeds maximum {} per transaction",
                count, self.max_tx_entries
            )));
        }
        Ok(())
    }
}
