//! Commit log
//!
//! One fixed-size record per committed transaction. A transaction is
//! durable exactly when its commit record is; the value and transaction
//! logs are written first and are unreachable without it.
//!
//! # Record Layout (128-byte payload, 136 bytes framed)
//!
//! ```text
//! id (8) | ts (8) | nentries (4) | tx_off (8) | tx_len (4)
//! | eh (32) | prev_alh (32) | alh (32)
//! ```
//!
//! Because every framed record is exactly [`COMMIT_RECORD_SIZE`] bytes and
//! global offsets are contiguous across segments, the record of transaction
//! `id` lives at global offset `(id - 1) * COMMIT_RECORD_SIZE`: lookup by
//! id is one seek, no index.

use std::path::Path;

use tracing::warn;

use veri_core::{Digest, Error, Result, TxId};

use crate::appendlog::{AppendLog, AppendOptions, Compression, FRAME_OVERHEAD};
use crate::chain;

/// Serialized payload size of one commit header.
pub const COMMIT_PAYLOAD_SIZE: usize = 128;

/// On-disk size of one framed commit record.
pub const COMMIT_RECORD_SIZE: u64 = (COMMIT_PAYLOAD_SIZE + FRAME_OVERHEAD) as u64;

/// Durable header of one committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHeader {
    /// Transaction id, assigned contiguously from 1.
    pub id: TxId,
    /// Commit timestamp, milliseconds since the Unix epoch.
    pub ts: u64,
    /// Number of entries in the transaction.
    pub nentries: u32,
    /// Global offset of the entry-list record in the transaction log.
    pub tx_off: u64,
    /// Serialized length of the entry-list record.
    pub tx_len: u32,
    /// Digest of the transaction's entry list.
    pub eh: Digest,
    /// Accumulated linear hash of the preceding transaction.
    pub prev_alh: Digest,
    /// Accumulated linear hash up to and including this transaction.
    pub alh: Digest,
}

impl TxHeader {
    /// Inner hash of this transaction, recomputed from the header fields.
    pub fn inner(&self) -> Digest {
        chain::inner_hash(self.id, self.ts, &self.eh)
    }

    /// Serialize to the fixed 128-byte payload.
    pub fn to_bytes(&self) -> [u8; COMMIT_PAYLOAD_SIZE] {
        let mut bytes = [0u8; COMMIT_PAYLOAD_SIZE];
        bytes[0..8].copy_from_slice(&self.id.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.ts.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.nentries.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.tx_off.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.tx_len.to_le_bytes());
        bytes[32..64].copy_from_slice(&self.eh);
        bytes[64..96].copy_from_slice(&self.prev_alh);
        bytes[96..128].copy_from_slice(&self.alh);
        bytes
    }

    /// Deserialize from the fixed 128-byte payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != COMMIT_PAYLOAD_SIZE {
            return Err(Error::Corrupted(format!(
                "commit record payload is {} bytes, expected {}",
                bytes.len(),
                COMMIT_PAYLOAD_SIZE
            )));
        }
        let digest = |range: std::ops::Range<usize>| -> Digest {
            bytes[range].try_into().expect("fixed 32-byte slice")
        };
        Ok(TxHeader {
            id: u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes")),
            ts: u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes")),
            nentries: u32::from_le_bytes(bytes[16..20].try_into().expect("4 bytes")),
            tx_off: u64::from_le_bytes(bytes[20..28].try_into().expect("8 bytes")),
            tx_len: u32::from_le_bytes(bytes[28..32].try_into().expect("4 bytes")),
            eh: digest(32..64),
            prev_alh: digest(64..96),
            alh: digest(96..128),
        })
    }
}

/// Append-only log of commit headers with O(1) lookup by transaction id.
pub struct CommitLog {
    log: AppendLog,
}

impl CommitLog {
    /// Open (or create) the commit log in `dir`.
    ///
    /// The compression option is ignored: commit records must stay
    /// fixed-size for offset arithmetic, so the identity codec is forced.
    /// A torn record at the tail (from a crash mid-append) is dropped.
    pub fn open(dir: &Path, mut opts: AppendOptions) -> Result<Self> {
        opts.compression = Compression::None;
        let read_only = opts.read_only;
        let log = AppendLog::open(dir, opts)?;

        let torn = log.tail() % COMMIT_RECORD_SIZE;
        if torn != 0 {
            if read_only {
                return Err(Error::Corrupted(format!(
                    "commit log tail {} is not record-aligned",
                    log.tail()
                )));
            }
            warn!(
                tail = log.tail(),
                dropped = torn,
                "dropping torn commit record at tail"
            );
            log.truncate_tail(log.tail() - torn)?;
        }
        Ok(CommitLog { log })
    }

    /// Id of the most recent committed transaction, 0 when empty.
    pub fn head(&self) -> TxId {
        self.log.tail() / COMMIT_RECORD_SIZE
    }

    /// Append the header of the next transaction.
    ///
    /// Ids must be contiguous: `header.id` has to be `head() + 1`.
    pub fn append_header(&self, header: &TxHeader) -> Result<()> {
        let expected = self.head() + 1;
        if header.id != expected {
            return Err(Error::InvalidArgument(format!(
                "commit header id {} out of order, expected {}",
                header.id, expected
            )));
        }
        let offset = self.log.append(&header.to_bytes())?;
        debug_assert_eq!(offset, (header.id - 1) * COMMIT_RECORD_SIZE);
        Ok(())
    }

    /// Read the header of transaction `id`.
    pub fn read_header(&self, id: TxId) -> Result<TxHeader> {
        if id == 0 || id > self.head() {
            return Err(Error::NotFound(format!(
                "transaction {} (head is {})",
                id,
                self.head()
            )));
        }
        let payload = self.log.read_record((id - 1) * COMMIT_RECORD_SIZE)?;
        let header = TxHeader::from_bytes(&payload)?;
        if header.id != id {
            return Err(Error::Corrupted(format!(
                "commit record at slot {} carries id {}",
                id, header.id
            )));
        }
        Ok(header)
    }

    /// Drop every record after transaction `id` (chain-validation recovery).
    pub fn truncate(&self, id: TxId) -> Result<()> {
        if id > self.head() {
            return Err(Error::InvalidArgument(format!(
                "cannot truncate commit log to {} (head is {})",
                id,
                self.head()
            )));
        }
        self.log.truncate_tail(id * COMMIT_RECORD_SIZE)
    }

    /// Make all appended headers durable.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use veri_core::NULL_DIGEST;

    fn header(id: TxId) -> TxHeader {
        TxHeader {
            id,
            ts: 1_700_000_000_000 + id,
            nentries: 2,
            tx_off: id * 100,
            tx_len: 64,
            eh: [id as u8; 32],
            prev_alh: NULL_DIGEST,
            alh: [0xAB; 32],
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let h = header(42);
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), COMMIT_PAYLOAD_SIZE);
        assert_eq!(TxHeader::from_bytes(&bytes).unwrap(), h);
    }

    #[test]
    fn test_append_read_by_id() {
        let dir = tempdir().unwrap();
        let clog = CommitLog::open(dir.path(), AppendOptions::default()).unwrap();
        assert_eq!(clog.head(), 0);

        for id in 1..=50 {
            clog.append_header(&header(id)).unwrap();
        }
        assert_eq!(clog.head(), 50);
        assert_eq!(clog.read_header(17).unwrap(), header(17));
        assert_eq!(clog.read_header(50).unwrap(), header(50));
        assert!(matches!(clog.read_header(51), Err(Error::NotFound(_))));
        assert!(matches!(clog.read_header(0), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let dir = tempdir().unwrap();
        let clog = CommitLog::open(dir.path(), AppendOptions::default()).unwrap();
        clog.append_header(&header(1)).unwrap();
        assert!(matches!(
            clog.append_header(&header(3)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_lookup_across_rollover() {
        let dir = tempdir().unwrap();
        let opts = AppendOptions {
            // Forces a rollover every few records.
            file_size: COMMIT_RECORD_SIZE * 4,
            ..AppendOptions::default()
        };
        let clog = CommitLog::open(dir.path(), opts).unwrap();
        for id in 1..=20 {
            clog.append_header(&header(id)).unwrap();
        }
        for id in 1..=20 {
            assert_eq!(clog.read_header(id).unwrap().id, id);
        }
    }

    #[test]
    fn test_torn_tail_dropped_on_open() {
        let dir = tempdir().unwrap();
        {
            let clog = CommitLog::open(dir.path(), AppendOptions::default()).unwrap();
            clog.append_header(&header(1)).unwrap();
            clog.append_header(&header(2)).unwrap();
        }
        // Simulate a crash mid-append of record 3.
        let seg = crate::segment::segment_path(dir.path(), 1);
        let mut bytes = std::fs::read(&seg).unwrap();
        bytes.extend_from_slice(&[0u8; 30]);
        std::fs::write(&seg, bytes).unwrap();

        let clog = CommitLog::open(dir.path(), AppendOptions::default()).unwrap();
        assert_eq!(clog.head(), 2);
        assert_eq!(clog.read_header(2).unwrap(), header(2));
        // The log accepts new appends after dropping the torn tail.
        clog.append_header(&header(3)).unwrap();
        assert_eq!(clog.head(), 3);
    }

    #[test]
    fn test_truncate_for_recovery() {
        let dir = tempdir().unwrap();
        let clog = CommitLog::open(dir.path(), AppendOptions::default()).unwrap();
        for id in 1..=10 {
            clog.append_header(&header(id)).unwrap();
        }
        clog.truncate(6).unwrap();
        assert_eq!(clog.head(), 6);
        assert!(clog.read_header(7).is_err());
        clog.append_header(&header(7)).unwrap();
        assert_eq!(clog.head(), 7);
    }

    #[test]
    fn test_compression_is_forced_off() {
        let dir = tempdir().unwrap();
        let opts = AppendOptions {
            compression: Compression::Zstd { level: 19 },
            ..AppendOptions::default()
        };
        let clog = CommitLog::open(dir.path(), opts).unwrap();
        clog.append_header(&header(1)).unwrap();
        // Fixed-size framing must hold for offset arithmetic.
        assert_eq!(clog.read_header(1).unwrap(), header(1));
        clog.append_header(&header(2)).unwrap();
        assert_eq!(clog.read_header(2).unwrap(), header(2));
    }
}
