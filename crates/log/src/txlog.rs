//! Transaction log
//!
//! Stores the entry list of each committed transaction. The commit log
//! holds the (offset, length) of each record, so this log is only read
//! when a transaction's entries are needed (proof generation, history
//! reads, index rebuild).
//!
//! # Record Layout
//!
//! ```text
//! id (8) | nentries (4) | entry*
//! entry: key_len (2) | key | meta (1) | value_ref (16)
//! ```

use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use veri_core::{EntryMeta, Error, Key, Result, TxEntry, TxId, ValueRef};

use crate::appendlog::{AppendLog, AppendOptions};
use crate::remote::Offloader;

/// Append-only store of per-transaction entry lists.
pub struct TxLog {
    log: AppendLog,
}

impl TxLog {
    /// Open (or create) the transaction log in `dir`.
    pub fn open(dir: &Path, opts: AppendOptions) -> Result<Self> {
        Ok(TxLog {
            log: AppendLog::open(dir, opts)?,
        })
    }

    /// Append the entry list of transaction `id`.
    ///
    /// Returns the record's global offset and serialized length, which the
    /// caller stores in the commit header.
    pub fn append(&self, id: TxId, entries: &[TxEntry]) -> Result<(u64, u32)> {
        let payload = encode_record(id, entries)?;
        let offset = self.log.append(&payload)?;
        Ok((offset, payload.len() as u32))
    }

    /// Read the entry list of the transaction recorded at `offset`.
    ///
    /// The id stored in the record must match `expected_id`; a mismatch
    /// means the commit header points at the wrong record.
    pub fn read(&self, offset: u64, expected_id: TxId) -> Result<Vec<TxEntry>> {
        let payload = self.log.read_record(offset)?;
        let (id, entries) = decode_record(&payload)?;
        if id != expected_id {
            return Err(Error::Corrupted(format!(
                "transaction record at offset {} has id {}, expected {}",
                offset, id, expected_id
            )));
        }
        Ok(entries)
    }

    /// Make all appended records durable.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Attach an offloader for cold-segment archival.
    pub fn set_offloader(&self, offloader: Offloader) {
        self.log.set_offloader(offloader)
    }

    /// Offload sealed segments; returns the number offloaded.
    pub fn offload_sealed(&self) -> Result<usize> {
        self.log.offload_sealed()
    }
}

fn encode_record(id: TxId, entries: &[TxEntry]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(12 + entries.len() * 32);
    buf.write_u64::<LittleEndian>(id)?;
    buf.write_u32::<LittleEndian>(entries.len() as u32)?;
    for entry in entries {
        let key = entry.key.as_bytes();
        buf.write_u16::<LittleEndian>(key.len() as u16)?;
        buf.extend_from_slice(key);
        buf.write_u8(entry.meta.as_byte())?;
        buf.extend_from_slice(&entry.value_ref.to_bytes());
    }
    Ok(buf)
}

fn decode_record(payload: &[u8]) -> Result<(TxId, Vec<TxEntry>)> {
    let corrupt = |what: &str| Error::Corrupted(format!("truncated transaction record: {}", what));

    let mut cur = Cursor::new(payload);
    let id = cur.read_u64::<LittleEndian>().map_err(|_| corrupt("id"))?;
    let n = cur
        .read_u32::<LittleEndian>()
        .map_err(|_| corrupt("entry count"))? as usize;

    let mut entries = Vec::with_capacity(n);
    for _ in 0..n {
        let key_len = cur
            .read_u16::<LittleEndian>()
            .map_err(|_| corrupt("key length"))? as usize;
        let pos = cur.position() as usize;
        let key_end = pos + key_len;
        if key_end > payload.len() {
            return Err(corrupt("key"));
        }
        let key = Key::from(&payload[pos..key_end]);
        cur.set_position(key_end as u64);

        let meta = EntryMeta::from_byte(cur.read_u8().map_err(|_| corrupt("meta"))?);
        let mut vref_bytes = [0u8; 16];
        std::io::Read::read_exact(&mut cur, &mut vref_bytes)
            .map_err(|_| corrupt("value reference"))?;
        let value_ref = ValueRef::from_bytes(&vref_bytes);

        entries.push(TxEntry {
            key,
            value_ref,
            meta,
        });
    }
    if cur.position() as usize != payload.len() {
        return Err(Error::Corrupted(
            "trailing bytes in transaction record".into(),
        ));
    }
    Ok((id, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries() -> Vec<TxEntry> {
        vec![
            TxEntry {
                key: Key::from(b"account/7".as_slice()),
                value_ref: ValueRef {
                    segment: 1,
                    offset: 0,
                    len: 12,
                },
                meta: EntryMeta::none(),
            },
            TxEntry {
                key: Key::from(b"account/9".as_slice()),
                value_ref: ValueRef {
                    segment: 1,
                    offset: 20,
                    len: 4,
                },
                meta: EntryMeta::deleted(),
            },
        ]
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let txlog = TxLog::open(dir.path(), AppendOptions::default()).unwrap();

        let (off, len) = txlog.append(1, &entries()).unwrap();
        assert!(len > 0);
        let got = txlog.read(off, 1).unwrap();
        assert_eq!(got, entries());
    }

    #[test]
    fn test_id_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let txlog = TxLog::open(dir.path(), AppendOptions::default()).unwrap();
        let (off, _) = txlog.append(5, &entries()).unwrap();
        assert!(matches!(txlog.read(off, 6), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_empty_entry_list() {
        let dir = tempdir().unwrap();
        let txlog = TxLog::open(dir.path(), AppendOptions::default()).unwrap();
        let (off, _) = txlog.append(1, &[]).unwrap();
        assert!(txlog.read(off, 1).unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let payload = encode_record(3, &entries()).unwrap();
        for cut in [4, 11, 13, payload.len() - 1] {
            assert!(decode_record(&payload[..cut]).is_err(), "cut {}", cut);
        }
        let mut extended = payload.clone();
        extended.push(0);
        assert!(decode_record(&extended).is_err());
    }
}
