//! Transaction builder
//!
//! A transaction is built entirely in memory and only touches the store
//! when committed. Dropping an uncommitted builder aborts it; nothing was
//! reserved, so abort is free. Writes to the same key within one
//! transaction are rejected up front, keeping the write set a set.

use rustc_hash::FxHashSet;

use veri_core::{EntryMeta, Error, Key, Limits, Result};

/// One buffered write.
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub key: Key,
    pub value: Vec<u8>,
    pub meta: EntryMeta,
}

/// An uncommitted batch of writes.
#[derive(Debug, Default)]
pub struct Transaction {
    pub(crate) writes: Vec<PendingWrite>,
    keys: FxHashSet<Key>,
}

impl Transaction {
    /// Create an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a write of `value` under `key`.
    pub fn set(&mut self, key: impl Into<Key>, value: impl Into<Vec<u8>>) -> Result<()> {
        self.push(key.into(), value.into(), EntryMeta::none())
    }

    /// Buffer a deletion of `key`.
    ///
    /// A deletion is a regular entry with a tombstone flag and an empty
    /// value; it stays in the history like any other write.
    pub fn delete(&mut self, key: impl Into<Key>) -> Result<()> {
        self.push(key.into(), Vec::new(), EntryMeta::deleted())
    }

    fn push(&mut self, key: Key, value: Vec<u8>, meta: EntryMeta) -> Result<()> {
        if !self.keys.insert(key.clone()) {
            return Err(Error::InvalidArgument(format!(
                "duplicate key in transaction: {:?}",
                key
            )));
        }
        self.writes.push(PendingWrite { key, value, meta });
        Ok(())
    }

    /// Number of buffered writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether the transaction has no writes.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// The keys this transaction writes.
    pub(crate) fn key_set(&self) -> FxHashSet<Key> {
        self.keys.clone()
    }

    /// Check the whole batch against the store's limits.
    pub(crate) fn validate(&self, limits: &Limits) -> Result<()> {
        limits.validate_entry_count(self.writes.len())?;
        for write in &self.writes {
            limits.validate_key(&write.key)?;
            limits.validate_value(&write.value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_delete() {
        let mut tx = Transaction::new();
        tx.set("a", b"1".to_vec()).unwrap();
        tx.delete("b").unwrap();
        assert_eq!(tx.len(), 2);
        assert!(tx.writes[1].meta.is_deleted());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut tx = Transaction::new();
        tx.set("k", b"1".to_vec()).unwrap();
        assert!(matches!(
            tx.set("k", b"2".to_vec()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(tx.delete("k").is_err());
    }

    #[test]
    fn test_validation_against_limits() {
        let limits = Limits {
            max_tx_entries: 2,
            max_key_len: 4,
            max_value_len: 8,
        };

        let tx = Transaction::new();
        assert!(tx.validate(&limits).is_err(), "empty transaction");

        let mut tx = Transaction::new();
        tx.set("long-key", b"v".to_vec()).unwrap();
        assert!(tx.validate(&limits).is_err(), "key too long");

        let mut tx = Transaction::new();
        tx.set("k", vec![0u8; 9]).unwrap();
        assert!(tx.validate(&limits).is_err(), "value too long");

        let mut tx = Transaction::new();
        tx.set("a", b"1".to_vec()).unwrap();
        tx.set("b", b"2".to_vec()).unwrap();
        tx.set("c", b"3".to_vec()).unwrap();
        assert!(tx.validate(&limits).is_err(), "too many entries");

        let mut tx = Transaction::new();
        tx.set("a", b"1".to_vec()).unwrap();
        tx.set("b", b"2".to_vec()).unwrap();
        assert!(tx.validate(&limits).is_ok());
    }
}
