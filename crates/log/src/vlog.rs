//! Value log
//!
//! Entry payloads live outside the transaction log, addressed by a 16-byte
//! [`ValueRef`]. Values are immutable once written; the log only grows, and
//! sealed value segments are prime candidates for remote offload.

use std::path::Path;

use veri_core::{Error, Result, ValueRef};

use crate::appendlog::{AppendLog, AppendOptions};
use crate::remote::Offloader;

/// Append-only store of entry values.
pub struct ValueLog {
    log: AppendLog,
}

impl ValueLog {
    /// Open (or create) the value log in `dir`.
    pub fn open(dir: &Path, opts: AppendOptions) -> Result<Self> {
        Ok(ValueLog {
            log: AppendLog::open(dir, opts)?,
        })
    }

    /// Append one value, returning the reference that addresses it.
    pub fn append_value(&self, value: &[u8]) -> Result<ValueRef> {
        let offset = self.log.append(value)?;
        Ok(ValueRef {
            segment: self.log.segment_of(offset)?,
            offset,
            len: value.len() as u32,
        })
    }

    /// Read the value a reference points at, verifying its length.
    pub fn read_value(&self, vref: &ValueRef) -> Result<Vec<u8>> {
        let value = self.log.read_record(vref.offset)?;
        if value.len() != vref.len as usize {
            return Err(Error::Corrupted(format!(
                "value at offset {} has length {}, reference says {}",
                vref.offset,
                value.len(),
                vref.len
            )));
        }
        Ok(value)
    }

    /// Make all appended values durable.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Attach an offloader for cold-segment archival.
    pub fn set_offloader(&self, offloader: Offloader) {
        self.log.set_offloader(offloader)
    }

    /// Offload sealed value segments; returns the number offloaded.
    pub fn offload_sealed(&self) -> Result<usize> {
        self.log.offload_sealed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appendlog::Compression;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_read_values() {
        let dir = tempdir().unwrap();
        let vlog = ValueLog::open(dir.path(), AppendOptions::default()).unwrap();

        let r1 = vlog.append_value(b"value-one").unwrap();
        let r2 = vlog.append_value(b"value-two").unwrap();
        assert_eq!(r1.len, 9);
        assert_ne!(r1.offset, r2.offset);

        assert_eq!(vlog.read_value(&r1).unwrap(), b"value-one");
        assert_eq!(vlog.read_value(&r2).unwrap(), b"value-two");
    }

    #[test]
    fn test_length_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let vlog = ValueLog::open(dir.path(), AppendOptions::default()).unwrap();
        let mut r = vlog.append_value(b"payload").unwrap();
        r.len = 3;
        assert!(matches!(vlog.read_value(&r), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_compressed_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let opts = AppendOptions {
            compression: Compression::Zstd { level: 3 },
            ..AppendOptions::default()
        };
        let r;
        {
            let vlog = ValueLog::open(dir.path(), opts.clone()).unwrap();
            r = vlog.append_value(&vec![9u8; 5000]).unwrap();
        }
        let vlog = ValueLog::open(dir.path(), opts).unwrap();
        assert_eq!(vlog.read_value(&r).unwrap(), vec![9u8; 5000]);
    }
}
