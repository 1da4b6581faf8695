//! Multi-segment appendable log
//!
//! An `AppendLog` is a durable, append-only byte stream split across
//! size-bounded segment files. Records are framed as
//! `len (4) | payload | crc32 (4)` with the payload passed through the
//! configured codec. Offsets are global and stay contiguous across segment
//! rollover; the segment index maps a global offset to (segment file,
//! local offset).
//!
//! Appends are serialized internally; reads go through a bounded FIFO
//! handle pool and never block appends. Sealed segments may be offloaded to
//! remote storage and replaced by a stub; reads of offloaded segments are
//! served by ranged remote fetches.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use veri_core::{Error, Result, MAX_FILE_SIZE};

use crate::codec::{IdentityCodec, LogCodec, ZstdCodec};
use crate::pool::HandlePool;
use crate::remote::Offloader;
use crate::segment::{
    read_header, segment_path, stub_path, Segment, SegmentHeader, SEGMENT_HEADER_SIZE, STUB_MAGIC,
};

/// Record frame overhead: 4-byte length prefix + 4-byte CRC32.
pub const FRAME_OVERHEAD: usize = 8;

/// Per-record compression applied before framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Store payloads as-is.
    #[default]
    None,
    /// Compress payloads with zstd at the given level.
    Zstd {
        /// zstd compression level (1..=19 useful range).
        level: i32,
    },
}

impl Compression {
    fn codec(&self) -> Box<dyn LogCodec> {
        match self {
            Compression::None => Box::new(IdentityCodec),
            Compression::Zstd { level } => Box::new(ZstdCodec::new(*level)),
        }
    }
}

/// Configuration of one appendable log.
#[derive(Debug, Clone)]
pub struct AppendOptions {
    /// Maximum data bytes per segment before rollover.
    pub file_size: u64,
    /// Sync after every append (durable on return) vs buffered writes.
    pub synced: bool,
    /// Maximum concurrently open read handles.
    pub max_open_files: usize,
    /// Per-record compression.
    pub compression: Compression,
    /// Write-buffer size for the active segment.
    pub write_buffer_size: usize,
    /// Reject appends, serve reads only.
    pub read_only: bool,
}

impl Default for AppendOptions {
    fn default() -> Self {
        AppendOptions {
            file_size: 1 << 29, // 512 MiB
            synced: true,
            max_open_files: 10,
            compression: Compression::None,
            write_buffer_size: crate::segment::DEFAULT_WRITE_BUFFER_SIZE,
            read_only: false,
        }
    }
}

impl AppendOptions {
    /// Validate the option combination.
    pub fn validate(&self) -> Result<()> {
        if self.file_size == 0 || self.file_size > MAX_FILE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "file_size must be in 1..={}",
                MAX_FILE_SIZE
            )));
        }
        if self.max_open_files == 0 {
            return Err(Error::InvalidConfig("max_open_files must be > 0".into()));
        }
        if self.write_buffer_size == 0 {
            return Err(Error::InvalidConfig("write_buffer_size must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SegmentMeta {
    number: u32,
    start: u64,
    len: u64,
    sealed: bool,
    offloaded: bool,
}

/// A durable, append-only byte stream over size-bounded segment files.
pub struct AppendLog {
    dir: PathBuf,
    opts: AppendOptions,
    codec: Box<dyn LogCodec>,
    /// Segment index, last entry is the active segment (when writable).
    segments: RwLock<Vec<SegmentMeta>>,
    /// Active segment writer; `None` in read-only mode.
    active: Mutex<Option<Segment>>,
    /// Global offset one past the last readable byte.
    tail: AtomicU64,
    pool: HandlePool,
    remote: RwLock<Option<Offloader>>,
}

impl AppendLog {
    /// Open (or create) an appendable log in `dir`.
    pub fn open(dir: &Path, opts: AppendOptions) -> Result<Self> {
        opts.validate()?;
        std::fs::create_dir_all(dir)?;

        let mut metas = Self::scan_segments(dir)?;

        let active = if opts.read_only {
            None
        } else if let Some(last) = metas.last_mut() {
            if last.offloaded {
                // Fully archived log: start a fresh segment after the end.
                let start = last.start + last.len;
                let number = last.number + 1;
                let seg = Segment::create_buffered(dir, number, start, opts.write_buffer_size)?;
                metas.push(SegmentMeta {
                    number,
                    start,
                    len: 0,
                    sealed: false,
                    offloaded: false,
                });
                Some(seg)
            } else if last.sealed {
                let start = last.start + last.len;
                let number = last.number + 1;
                let seg = Segment::create_buffered(dir, number, start, opts.write_buffer_size)?;
                metas.push(SegmentMeta {
                    number,
                    start,
                    len: 0,
                    sealed: false,
                    offloaded: false,
                });
                Some(seg)
            } else {
                Some(Segment::open_append_buffered(
                    dir,
                    last.number,
                    opts.write_buffer_size,
                )?)
            }
        } else {
            let seg = Segment::create_buffered(dir, 1, 0, opts.write_buffer_size)?;
            metas.push(SegmentMeta {
                number: 1,
                start: 0,
                len: 0,
                sealed: false,
                offloaded: false,
            });
            Some(seg)
        };

        let tail = metas.last().map(|m| m.start + m.len).unwrap_or(0);
        let pool = HandlePool::new(dir, opts.max_open_files);
        let codec = opts.compression.codec();

        debug!(dir = %dir.display(), segments = metas.len(), tail, "append log opened");

        Ok(AppendLog {
            dir: dir.to_path_buf(),
            opts,
            codec,
            segments: RwLock::new(metas),
            active: Mutex::new(active),
            tail: AtomicU64::new(tail),
            pool,
            remote: RwLock::new(None),
        })
    }

    fn scan_segments(dir: &Path) -> Result<Vec<SegmentMeta>> {
        let mut metas = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let (stub, number) = if let Some(num) = name.strip_suffix(".seg") {
                (false, num.parse::<u32>().ok())
            } else if let Some(num) = name.strip_suffix(".stub") {
                (true, num.parse::<u32>().ok())
            } else {
                (false, None)
            };
            let Some(number) = number else { continue };

            let mut file = File::open(entry.path())?;
            let header = read_header(&mut file, &entry.path())?;
            if header.number != number {
                return Err(Error::Corrupted(format!(
                    "segment file {:?} carries number {}",
                    entry.path(),
                    header.number
                )));
            }
            let len = if stub || header.sealed_len > 0 {
                header.sealed_len
            } else {
                file.metadata()?.len().saturating_sub(SEGMENT_HEADER_SIZE as u64)
            };
            metas.push(SegmentMeta {
                number,
                start: header.start_offset,
                len,
                sealed: stub || header.sealed_len > 0,
                offloaded: stub || header.magic == STUB_MAGIC,
            });
        }

        metas.sort_by_key(|m| m.number);
        for pair in metas.windows(2) {
            if pair[1].start != pair[0].start + pair[0].len {
                return Err(Error::Corrupted(format!(
                    "segment {} does not continue segment {} (offset gap)",
                    pair[1].number, pair[0].number
                )));
            }
            if !pair[0].sealed {
                return Err(Error::Corrupted(format!(
                    "segment {} is unsealed but not the last segment",
                    pair[0].number
                )));
            }
        }
        Ok(metas)
    }

    /// Attach an offloader for cold-segment archival.
    pub fn set_offloader(&self, offloader: Offloader) {
        *self.remote.write() = Some(offloader);
    }

    /// Global offset one past the last committed byte.
    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::SeqCst)
    }

    /// Number of segments (including offloaded stubs).
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Number of the segment holding the record at `offset`.
    pub fn segment_of(&self, offset: u64) -> Result<u32> {
        if offset >= self.tail() {
            return Err(Error::NotFound(format!(
                "offset {} beyond committed tail {}",
                offset,
                self.tail()
            )));
        }
        Ok(self.locate(offset)?.number)
    }

    /// Append one record, returning its global offset.
    pub fn append(&self, payload: &[u8]) -> Result<u64> {
        if self.opts.read_only {
            return Err(Error::ReadOnly);
        }

        let encoded = self.codec.encode(payload)?;
        let mut frame = Vec::with_capacity(encoded.len() + FRAME_OVERHEAD);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32(&encoded).to_le_bytes());

        let mut guard = self.active.lock();
        let segment = guard.as_mut().ok_or(Error::ReadOnly)?;

        if segment.data_len() > 0
            && segment.data_len() + frame.len() as u64 > self.opts.file_size
        {
            self.rollover(segment)?;
        }
        let segment = guard.as_mut().unwrap();

        let offset = segment.header().start_offset + segment.data_len();
        segment.write(&frame)?;
        segment.flush()?;
        if self.opts.synced {
            segment.sync()?;
        }

        {
            let mut metas = self.segments.write();
            let meta = metas.last_mut().expect("active segment meta");
            meta.len = segment.data_len();
        }
        self.tail.store(offset + frame.len() as u64, Ordering::SeqCst);
        Ok(offset)
    }

    /// Seal the current segment and start a new one.
    fn rollover(&self, current: &mut Segment) -> Result<()> {
        current.seal()?;
        let number = current.number() + 1;
        let start = current.header().start_offset + current.data_len();

        info!(
            old = current.number(),
            new = number,
            start, "segment rollover"
        );

        let next =
            Segment::create_buffered(&self.dir, number, start, self.opts.write_buffer_size)?;
        {
            let mut metas = self.segments.write();
            let meta = metas.last_mut().expect("active segment meta");
            meta.len = current.data_len();
            meta.sealed = true;
            metas.push(SegmentMeta {
                number,
                start,
                len: 0,
                sealed: false,
                offloaded: false,
            });
        }
        // Safe: the caller holds the active lock, we are replacing its
        // contents in place.
        *current = next;
        Ok(())
    }

    /// Push buffered bytes of the active segment to the OS.
    pub fn flush(&self) -> Result<()> {
        if let Some(segment) = self.active.lock().as_mut() {
            segment.flush()?;
        }
        Ok(())
    }

    /// Make all appended bytes durable.
    pub fn sync(&self) -> Result<()> {
        if let Some(segment) = self.active.lock().as_mut() {
            segment.sync()?;
        }
        Ok(())
    }

    /// Read the decoded payload of the record at `offset`.
    ///
    /// Reading past the committed tail is `NotFound`. A checksum mismatch is
    /// `Corrupted`, unless the segment has a remote copy that revalidates.
    pub fn read_record(&self, offset: u64) -> Result<Vec<u8>> {
        if offset >= self.tail() {
            return Err(Error::NotFound(format!(
                "offset {} beyond committed tail {}",
                offset,
                self.tail()
            )));
        }
        let meta = self.locate(offset)?;
        let local = offset - meta.start;

        if meta.offloaded {
            return self.read_remote_record(&meta, local);
        }

        match self.read_local_record(&meta, local) {
            Ok(payload) => Ok(payload),
            Err(Error::Corrupted(msg)) if meta.sealed => {
                // Local copy is damaged; a remote copy may still be good.
                let has_remote = {
                    let remote = self.remote.read();
                    match remote.as_ref() {
                        Some(off) => off.segment_exists(meta.number).unwrap_or(false),
                        None => false,
                    }
                };
                if has_remote {
                    warn!(
                        segment = meta.number,
                        offset, "local checksum mismatch, refetching from remote"
                    );
                    self.read_remote_record(&meta, local)
                } else {
                    Err(Error::Corrupted(msg))
                }
            }
            Err(e) => Err(e),
        }
    }

    fn locate(&self, offset: u64) -> Result<SegmentMeta> {
        let metas = self.segments.read();
        let idx = metas
            .partition_point(|m| m.start <= offset)
            .checked_sub(1)
            .ok_or_else(|| Error::NotFound(format!("offset {} before log start", offset)))?;
        Ok(metas[idx])
    }

    fn read_local_record(&self, meta: &SegmentMeta, local: u64) -> Result<Vec<u8>> {
        self.pool.with_handle(meta.number, |file| {
            read_frame_from(file, SEGMENT_HEADER_SIZE as u64 + local)
        })
        .and_then(|encoded| self.codec.decode(&encoded))
    }

    fn read_remote_record(&self, meta: &SegmentMeta, local: u64) -> Result<Vec<u8>> {
        let remote = self.remote.read();
        let offloader = remote.as_ref().ok_or_else(|| {
            Error::Corrupted(format!(
                "segment {} is offloaded but no remote storage is configured",
                meta.number
            ))
        })?;

        let file_off = SEGMENT_HEADER_SIZE as u64 + local;
        let len_bytes = offloader.fetch(meta.number, file_off, 4)?;
        let len = u32::from_le_bytes(len_bytes[..4].try_into().unwrap()) as u64;
        let body = offloader.fetch(meta.number, file_off + 4, len + 4)?;

        let encoded = &body[..len as usize];
        let stored_crc = u32::from_le_bytes(body[len as usize..].try_into().unwrap());
        if crc32(encoded) != stored_crc {
            return Err(Error::Corrupted(format!(
                "checksum mismatch in remote copy of segment {}",
                meta.number
            )));
        }
        self.codec.decode(encoded)
    }

    /// Offload every sealed, not-yet-offloaded segment to remote storage,
    /// replacing local files with stubs. Returns the number offloaded.
    pub fn offload_sealed(&self) -> Result<usize> {
        let targets: Vec<SegmentMeta> = self
            .segments
            .read()
            .iter()
            .filter(|m| m.sealed && !m.offloaded)
            .copied()
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let remote = self.remote.read();
        let offloader = remote
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("no remote storage configured".into()))?;

        let mut count = 0;
        for meta in targets {
            let seg_path = segment_path(&self.dir, meta.number);
            offloader.upload_segment(meta.number, &seg_path)?;

            // Write the stub before removing the segment so a crash between
            // the two steps leaves both copies readable.
            let mut header = SegmentHeader::new(meta.number, meta.start);
            header.magic = STUB_MAGIC;
            header.sealed_len = meta.len;
            let stub = stub_path(&self.dir, meta.number);
            let mut file = File::create(&stub)?;
            file.write_all(&header.to_bytes())?;
            file.sync_all()?;

            self.pool.evict(meta.number);
            std::fs::remove_file(&seg_path)?;

            let mut metas = self.segments.write();
            if let Some(m) = metas.iter_mut().find(|m| m.number == meta.number) {
                m.offloaded = true;
            }
            count += 1;
        }
        info!(count, dir = %self.dir.display(), "segments offloaded");
        Ok(count)
    }

    /// Truncate the log so the committed tail becomes `new_tail`.
    ///
    /// Only the active segment can be truncated; used by commit-log
    /// recovery to drop a torn tail record.
    pub fn truncate_tail(&self, new_tail: u64) -> Result<()> {
        let mut guard = self.active.lock();
        let segment = guard.as_mut().ok_or(Error::ReadOnly)?;
        let start = segment.header().start_offset;
        if new_tail < start || new_tail > self.tail() {
            return Err(Error::Corrupted(format!(
                "cannot truncate to {} (active segment starts at {}, tail {})",
                new_tail,
                start,
                self.tail()
            )));
        }
        segment.truncate(new_tail - start)?;
        segment.sync()?;
        {
            let mut metas = self.segments.write();
            let meta = metas.last_mut().expect("active segment meta");
            meta.len = segment.data_len();
        }
        self.tail.store(new_tail, Ordering::SeqCst);
        Ok(())
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn read_frame_from(file: &mut File, file_off: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(file_off))?;
    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut body = vec![0u8; len + 4];
    file.read_exact(&mut body)?;

    let encoded = &body[..len];
    let stored_crc = u32::from_le_bytes(body[len..].try_into().unwrap());
    if crc32(encoded) != stored_crc {
        return Err(Error::Corrupted(format!(
            "checksum mismatch at file offset {}",
            file_off
        )));
    }
    Ok(encoded.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryStorage;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn small_opts() -> AppendOptions {
        AppendOptions {
            file_size: 128,
            max_open_files: 4,
            ..AppendOptions::default()
        }
    }

    #[test]
    fn test_append_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let log = AppendLog::open(dir.path(), AppendOptions::default()).unwrap();

        let off_a = log.append(b"alpha").unwrap();
        let off_b = log.append(b"beta").unwrap();
        assert!(off_b > off_a);

        assert_eq!(log.read_record(off_a).unwrap(), b"alpha");
        assert_eq!(log.read_record(off_b).unwrap(), b"beta");
    }

    #[test]
    fn test_read_past_tail_is_not_found() {
        let dir = tempdir().unwrap();
        let log = AppendLog::open(dir.path(), AppendOptions::default()).unwrap();
        log.append(b"x").unwrap();
        assert!(matches!(
            log.read_record(log.tail()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_rollover_keeps_offsets_contiguous() {
        let dir = tempdir().unwrap();
        let log = AppendLog::open(dir.path(), small_opts()).unwrap();

        let mut offsets = Vec::new();
        for i in 0..20u8 {
            offsets.push((log.append(&vec![i; 40]).unwrap(), i));
        }
        assert!(log.segment_count() > 1, "expected rollover");

        // Offsets are dense: each record starts where the previous ended.
        for w in offsets.windows(2) {
            assert_eq!(w[1].0, w[0].0 + 40 + FRAME_OVERHEAD as u64);
        }
        for (off, i) in offsets {
            assert_eq!(log.read_record(off).unwrap(), vec![i; 40]);
        }
    }

    #[test]
    fn test_reopen_resumes_appending() {
        let dir = tempdir().unwrap();
        let off_a;
        {
            let log = AppendLog::open(dir.path(), small_opts()).unwrap();
            off_a = log.append(b"first").unwrap();
        }
        let log = AppendLog::open(dir.path(), small_opts()).unwrap();
        let off_b = log.append(b"second").unwrap();
        assert!(off_b > off_a);
        assert_eq!(log.read_record(off_a).unwrap(), b"first");
        assert_eq!(log.read_record(off_b).unwrap(), b"second");
    }

    #[test]
    fn test_read_only_rejects_appends() {
        let dir = tempdir().unwrap();
        {
            let log = AppendLog::open(dir.path(), small_opts()).unwrap();
            log.append(b"data").unwrap();
        }
        let opts = AppendOptions {
            read_only: true,
            ..small_opts()
        };
        let log = AppendLog::open(dir.path(), opts).unwrap();
        assert!(matches!(log.append(b"nope"), Err(Error::ReadOnly)));
        assert_eq!(log.read_record(0).unwrap(), b"data");
    }

    #[test]
    fn test_compression_roundtrip() {
        let dir = tempdir().unwrap();
        let opts = AppendOptions {
            compression: Compression::Zstd { level: 3 },
            ..AppendOptions::default()
        };
        let log = AppendLog::open(dir.path(), opts).unwrap();
        let payload = vec![42u8; 10_000];
        let off = log.append(&payload).unwrap();
        assert_eq!(log.read_record(off).unwrap(), payload);
        // The frame on disk is much smaller than the payload.
        assert!(log.tail() < 1000);
    }

    #[test]
    fn test_corrupted_record_detected() {
        let dir = tempdir().unwrap();
        let off;
        {
            let log = AppendLog::open(dir.path(), small_opts()).unwrap();
            off = log.append(b"precious").unwrap();
        }
        // Flip one payload byte on disk.
        let path = segment_path(dir.path(), 1);
        let mut bytes = std::fs::read(&path).unwrap();
        let pos = SEGMENT_HEADER_SIZE + 5;
        bytes[pos] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let log = AppendLog::open(dir.path(), small_opts()).unwrap();
        assert!(matches!(
            log.read_record(off),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_offload_and_remote_read() {
        let dir = tempdir().unwrap();
        let log = AppendLog::open(dir.path(), small_opts()).unwrap();
        let storage = Arc::new(MemoryStorage::new());
        log.set_offloader(Offloader::new(storage, "db/test"));

        let mut offsets = Vec::new();
        for i in 0..20u8 {
            offsets.push((log.append(&vec![i; 40]).unwrap(), i));
        }
        let offloaded = log.offload_sealed().unwrap();
        assert!(offloaded > 0);

        // All records still readable, including those now remote.
        for (off, i) in offsets {
            assert_eq!(log.read_record(off).unwrap(), vec![i; 40]);
        }
    }

    #[test]
    fn test_reopen_with_stubs() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let mut offsets = Vec::new();
        {
            let log = AppendLog::open(dir.path(), small_opts()).unwrap();
            log.set_offloader(Offloader::new(Arc::clone(&storage), "db/test"));
            for i in 0..20u8 {
                offsets.push((log.append(&vec![i; 40]).unwrap(), i));
            }
            log.offload_sealed().unwrap();
        }
        let log = AppendLog::open(dir.path(), small_opts()).unwrap();
        log.set_offloader(Offloader::new(storage, "db/test"));
        for (off, i) in offsets {
            assert_eq!(log.read_record(off).unwrap(), vec![i; 40]);
        }
    }

    #[test]
    fn test_truncate_tail() {
        let dir = tempdir().unwrap();
        let log = AppendLog::open(dir.path(), AppendOptions::default()).unwrap();
        let off_a = log.append(b"keep").unwrap();
        let off_b = log.append(b"drop").unwrap();

        log.truncate_tail(off_b).unwrap();
        assert_eq!(log.tail(), off_b);
        assert_eq!(log.read_record(off_a).unwrap(), b"keep");
        assert!(log.read_record(off_b).is_err());

        // Appending continues from the truncated tail.
        let off_c = log.append(b"next").unwrap();
        assert_eq!(off_c, off_b);
    }
}
