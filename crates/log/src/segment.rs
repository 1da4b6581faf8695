//! Segment files composing one appendable log
//!
//! Segments are named `NNNNNNNN.seg` (zero-padded segment number) inside
//! the log's directory. A segment that has been offloaded to remote storage
//! is replaced by an `NNNNNNNN.stub` file carrying the same header.
//!
//! # Segment Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment Header (32 bytes)          │
//! ├────────────────────────────────────┤
//! │ Record 1                           │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! The header stores the global data offset the segment starts at, so a
//! reopened log can rebuild its segment index without replaying records.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use veri_core::{Error, Result};

/// Magic bytes identifying a segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"VSEG";

/// Magic bytes identifying an offload stub.
pub const STUB_MAGIC: [u8; 4] = *b"VSTB";

/// Current segment format version.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of the segment header in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Default write-buffer size for the active segment.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 8 * 1024;

/// Segment header (32 bytes), written at the beginning of each file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes.
    pub magic: [u8; 4],
    /// Format version.
    pub format_version: u32,
    /// Segment number (monotonically increasing within one log).
    pub number: u32,
    /// Global data offset at which this segment begins.
    pub start_offset: u64,
    /// Data length at seal time; 0 while the segment is active.
    pub sealed_len: u64,
}

impl SegmentHeader {
    /// Create a header for a new active segment.
    pub fn new(number: u32, start_offset: u64) -> Self {
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            number,
            start_offset,
            sealed_len: 0,
        }
    }

    /// Serialize to the fixed 32-byte layout.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.number.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.start_offset.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.sealed_len.to_le_bytes());
        bytes
    }

    /// Deserialize from the fixed 32-byte layout.
    pub fn from_bytes(bytes: &[u8; SEGMENT_HEADER_SIZE]) -> Option<Self> {
        let header = SegmentHeader {
            magic: bytes[0..4].try_into().ok()?,
            format_version: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            number: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
            start_offset: u64::from_le_bytes(bytes[12..20].try_into().ok()?),
            sealed_len: u64::from_le_bytes(bytes[20..28].try_into().ok()?),
        };
        Some(header)
    }

    /// Whether the magic and version are recognized.
    pub fn is_valid(&self) -> bool {
        (self.magic == SEGMENT_MAGIC || self.magic == STUB_MAGIC)
            && self.format_version == SEGMENT_FORMAT_VERSION
    }
}

/// Path of a segment file.
pub fn segment_path(dir: &Path, number: u32) -> PathBuf {
    dir.join(format!("{:08}.seg", number))
}

/// Path of an offload stub file.
pub fn stub_path(dir: &Path, number: u32) -> PathBuf {
    dir.join(format!("{:08}.stub", number))
}

/// The active (writable) segment of an appendable log.
///
/// Only one segment per log is ever writable; sealed segments are immutable
/// and read through the handle pool.
pub struct Segment {
    writer: BufWriter<File>,
    header: SegmentHeader,
    /// Data bytes written (excluding the header).
    data_len: u64,
    path: PathBuf,
    sealed: bool,
}

impl Segment {
    /// Create a new active segment.
    pub fn create(dir: &Path, number: u32, start_offset: u64) -> Result<Self> {
        Self::create_buffered(dir, number, start_offset, DEFAULT_WRITE_BUFFER_SIZE)
    }

    /// Create a new active segment with an explicit write-buffer size.
    pub fn create_buffered(
        dir: &Path,
        number: u32,
        start_offset: u64,
        buffer_size: usize,
    ) -> Result<Self> {
        let path = segment_path(dir, number);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)?;

        let header = SegmentHeader::new(number, start_offset);
        file.write_all(&header.to_bytes())?;

        Ok(Segment {
            writer: BufWriter::with_capacity(buffer_size.max(1), file),
            header,
            data_len: 0,
            path,
            sealed: false,
        })
    }

    /// Reopen an existing segment for appending (crash/restart resume).
    pub fn open_append(dir: &Path, number: u32) -> Result<Self> {
        Self::open_append_buffered(dir, number, DEFAULT_WRITE_BUFFER_SIZE)
    }

    /// Reopen for appending with an explicit write-buffer size.
    pub fn open_append_buffered(dir: &Path, number: u32, buffer_size: usize) -> Result<Self> {
        let path = segment_path(dir, number);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let header = read_header(&mut file, &path)?;
        let end = file.seek(SeekFrom::End(0))?;
        let data_len = end.saturating_sub(SEGMENT_HEADER_SIZE as u64);

        Ok(Segment {
            writer: BufWriter::with_capacity(buffer_size.max(1), file),
            header,
            data_len,
            path,
            sealed: false,
        })
    }

    /// The segment header.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Segment number.
    pub fn number(&self) -> u32 {
        self.header.number
    }

    /// Data bytes written so far (excluding the header).
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    /// Path of the segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append bytes to the segment.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.sealed {
            return Err(Error::Corrupted(format!(
                "write to sealed segment {}",
                self.header.number
            )));
        }
        self.writer.write_all(data)?;
        self.data_len += data.len() as u64;
        Ok(())
    }

    /// Push buffered bytes to the OS. Without a following [`Segment::sync`]
    /// they may still be lost on crash.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Make all written bytes durable.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Seal the segment: record its final data length in the header, sync,
    /// and mark it immutable.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.writer.flush()?;
        self.header.sealed_len = self.data_len;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.header.to_bytes())?;
        file.seek(SeekFrom::End(0))?;
        file.sync_all()?;
        self.sealed = true;
        Ok(())
    }

    /// Truncate the segment's data to `data_len` bytes.
    ///
    /// Used by commit-log recovery to drop a partially written tail record.
    pub fn truncate(&mut self, data_len: u64) -> Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.set_len(SEGMENT_HEADER_SIZE as u64 + data_len)?;
        file.seek(SeekFrom::End(0))?;
        self.data_len = data_len;
        Ok(())
    }
}

/// Read and validate a segment header from an open file.
pub fn read_header(file: &mut File, path: &Path) -> Result<SegmentHeader> {
    let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut bytes)?;
    let header = SegmentHeader::from_bytes(&bytes)
        .filter(|h| h.is_valid())
        .ok_or_else(|| Error::Corrupted(format!("invalid segment header in {:?}", path)))?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_header_roundtrip() {
        let header = SegmentHeader::new(7, 4096);
        let parsed = SegmentHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_valid());
    }

    #[test]
    fn test_header_invalid_magic() {
        let mut header = SegmentHeader::new(1, 0);
        header.magic = *b"XXXX";
        assert!(!header.is_valid());
    }

    #[test]
    fn test_segment_path_format() {
        let dir = Path::new("/data/vlog");
        assert_eq!(
            segment_path(dir, 1),
            PathBuf::from("/data/vlog/00000001.seg")
        );
        assert_eq!(
            stub_path(dir, 42),
            PathBuf::from("/data/vlog/00000042.stub")
        );
    }

    #[test]
    fn test_create_write_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut seg = Segment::create(dir.path(), 1, 0).unwrap();
            seg.write(b"hello").unwrap();
            seg.sync().unwrap();
        }
        let seg = Segment::open_append(dir.path(), 1).unwrap();
        assert_eq!(seg.number(), 1);
        assert_eq!(seg.data_len(), 5);
    }

    #[test]
    fn test_seal_records_length_and_blocks_writes() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::create(dir.path(), 3, 100).unwrap();
        seg.write(b"abcdef").unwrap();
        seg.seal().unwrap();
        assert!(seg.write(b"more").is_err());

        let mut file = File::open(segment_path(dir.path(), 3)).unwrap();
        let header = read_header(&mut file, seg.path()).unwrap();
        assert_eq!(header.sealed_len, 6);
        assert_eq!(header.start_offset, 100);
    }

    #[test]
    fn test_truncate_drops_tail() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::create(dir.path(), 1, 0).unwrap();
        seg.write(b"0123456789").unwrap();
        seg.truncate(4).unwrap();
        assert_eq!(seg.data_len(), 4);

        let len = std::fs::metadata(segment_path(dir.path(), 1)).unwrap().len();
        assert_eq!(len, SEGMENT_HEADER_SIZE as u64 + 4);
    }
}
