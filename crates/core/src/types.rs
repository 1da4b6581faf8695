//! Core data model: transaction ids, keys, value references, entries
//!
//! A committed transaction is an ordered sequence of [`TxEntry`] values.
//! Entry payloads live in the value log and are addressed by [`ValueRef`];
//! the transaction log only carries the references, so metadata scans never
//! touch large values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction identifier.
///
/// Strictly increasing from 1, contiguous and gapless. Id 0 is reserved for
/// "no transaction" (the state before the first commit).
pub type TxId = u64;

/// A SHA-256 digest.
pub type Digest = [u8; 32];

/// The all-zero digest, used as the chained hash preceding transaction 1.
pub const NULL_DIGEST: Digest = [0u8; 32];

/// A user key: a bounded byte sequence.
///
/// Keys compare bytewise; the index defines global key ordering, the log
/// does not.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    /// Create a key from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Key(bytes.into())
    }

    /// The key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume the key, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", String::from_utf8_lossy(&self.0))
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key(bytes)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.as_bytes().to_vec())
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Address of a value in the value log: (segment, offset, length).
///
/// The offset is global across segments; the segment field lets readers
/// route to the right file (or its remote copy) without consulting the
/// segment index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueRef {
    /// Segment number holding the value.
    pub segment: u32,
    /// Global offset of the value record.
    pub offset: u64,
    /// Value length in bytes (uncompressed).
    pub len: u32,
}

/// Encoded size of a [`ValueRef`] on disk.
pub const VALUE_REF_SIZE: usize = 16;

impl ValueRef {
    /// Serialize to a fixed 16-byte layout: segment (4) | offset (8) | len (4).
    pub fn to_bytes(&self) -> [u8; VALUE_REF_SIZE] {
        let mut buf = [0u8; VALUE_REF_SIZE];
        buf[0..4].copy_from_slice(&self.segment.to_le_bytes());
        buf[4..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12..16].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    /// Deserialize from the fixed 16-byte layout.
    pub fn from_bytes(bytes: &[u8; VALUE_REF_SIZE]) -> Self {
        ValueRef {
            segment: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            offset: u64::from_le_bytes(bytes[4..12].try_into().unwrap()),
            len: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        }
    }
}

/// Per-entry metadata flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryMeta(u8);

const META_DELETED: u8 = 1 << 0;

impl EntryMeta {
    /// Metadata with no flags set.
    pub fn none() -> Self {
        EntryMeta(0)
    }

    /// Metadata marking the entry as a deletion.
    pub fn deleted() -> Self {
        EntryMeta(META_DELETED)
    }

    /// Whether this entry is a deletion marker.
    pub fn is_deleted(&self) -> bool {
        self.0 & META_DELETED != 0
    }

    /// The raw flag byte, as stored in the transaction log.
    pub fn as_byte(&self) -> u8 {
        self.0
    }

    /// Rebuild from the raw flag byte.
    pub fn from_byte(b: u8) -> Self {
        EntryMeta(b)
    }
}

/// One entry of a committed transaction: key plus value-log reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEntry {
    /// The user key.
    pub key: Key,
    /// Where the value bytes live in the value log.
    pub value_ref: ValueRef,
    /// Entry metadata (deletion marker).
    pub meta: EntryMeta,
}

impl TxEntry {
    /// Create an entry.
    pub fn new(key: Key, value_ref: ValueRef, meta: EntryMeta) -> Self {
        TxEntry {
            key,
            value_ref,
            meta,
        }
    }
}
