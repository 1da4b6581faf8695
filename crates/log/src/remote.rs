//! Remote archival interface for cold-segment offload
//!
//! The engine only ever speaks this narrow byte-range interface; concrete
//! backends (object stores) live entirely outside the core. An in-memory
//! backend is provided for tests and for exercising offload logic without a
//! network.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use veri_core::{Error, Result};

/// One remote object as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Object name, relative to the listed prefix.
    pub name: String,
    /// Object size in bytes.
    pub size: u64,
}

/// Capability interface consumed by the engine for cold-segment archival.
///
/// Contract:
/// - Names must not start or end with a path separator.
/// - `list_entries` must return entries and sub-prefixes in ascending
///   lexicographic order; an unsorted listing is a protocol violation and
///   the call is treated as failed.
pub trait RemoteStorage: Send + Sync {
    /// Human-readable backend kind, for logs.
    fn kind(&self) -> &str;

    /// Read `size` bytes of object `name` starting at `offset`.
    fn get(&self, name: &str, offset: u64, size: u64) -> Result<Vec<u8>>;

    /// Upload the file at `local_file` as object `name`.
    fn put(&self, name: &str, local_file: &Path) -> Result<()>;

    /// Whether object `name` exists.
    fn exists(&self, name: &str) -> Result<bool>;

    /// List objects and sub-prefixes under `prefix`.
    fn list_entries(&self, prefix: &str) -> Result<(Vec<EntryInfo>, Vec<String>)>;
}

impl fmt::Debug for dyn RemoteStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteStorage({})", self.kind())
    }
}

/// Validate a remote object name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return Err(Error::InvalidArgument(format!(
            "invalid remote object name: {:?}",
            name
        )));
    }
    Ok(())
}

/// Call `list_entries` and enforce the sorted-results contract.
pub fn checked_list_entries(
    storage: &dyn RemoteStorage,
    prefix: &str,
) -> Result<(Vec<EntryInfo>, Vec<String>)> {
    let (entries, prefixes) = storage.list_entries(prefix)?;
    let entries_sorted = entries.windows(2).all(|w| w[0].name <= w[1].name);
    let prefixes_sorted = prefixes.windows(2).all(|w| w[0] <= w[1]);
    if !entries_sorted || !prefixes_sorted {
        return Err(Error::Corrupted(format!(
            "remote backend {} returned unsorted listing for {:?}",
            storage.kind(),
            prefix
        )));
    }
    Ok((entries, prefixes))
}

/// In-memory remote storage backend, used by tests.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Corrupt one byte of a stored object (test helper).
    pub fn corrupt(&self, name: &str, at: usize) {
        if let Some(bytes) = self.objects.write().get_mut(name) {
            if at < bytes.len() {
                bytes[at] ^= 0xFF;
            }
        }
    }
}

impl RemoteStorage for MemoryStorage {
    fn kind(&self) -> &str {
        "memory"
    }

    fn get(&self, name: &str, offset: u64, size: u64) -> Result<Vec<u8>> {
        validate_name(name)?;
        let objects = self.objects.read();
        let bytes = objects
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("remote object {:?}", name)))?;
        let start = offset as usize;
        let end = start + size as usize;
        if end > bytes.len() {
            return Err(Error::NotFound(format!(
                "range {}..{} beyond object {:?} ({} bytes)",
                start,
                end,
                name,
                bytes.len()
            )));
        }
        Ok(bytes[start..end].to_vec())
    }

    fn put(&self, name: &str, local_file: &Path) -> Result<()> {
        validate_name(name)?;
        let bytes = std::fs::read(local_file)?;
        self.objects.write().insert(name.to_string(), bytes);
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        Ok(self.objects.read().contains_key(name))
    }

    fn list_entries(&self, prefix: &str) -> Result<(Vec<EntryInfo>, Vec<String>)> {
        let objects = self.objects.read();
        let mut entries = Vec::new();
        let mut prefixes = Vec::new();
        for (name, bytes) in objects.range(prefix.to_string()..) {
            if !name.starts_with(prefix) {
                break;
            }
            let rest = &name[prefix.len()..];
            match rest.find('/') {
                Some(pos) => {
                    let sub = rest[..pos].to_string();
                    if prefixes.last() != Some(&sub) {
                        prefixes.push(sub);
                    }
                }
                None => entries.push(EntryInfo {
                    name: rest.to_string(),
                    size: bytes.len() as u64,
                }),
            }
        }
        Ok((entries, prefixes))
    }
}

/// Default bounded attempts for transient remote fetch failures.
pub const DEFAULT_MAX_REMOTE_RETRIES: usize = 3;

/// Uploads sealed segments and serves byte ranges from their remote copies.
pub struct Offloader {
    storage: std::sync::Arc<dyn RemoteStorage>,
    prefix: String,
    max_retries: usize,
    retry_delay: Duration,
}

impl Offloader {
    /// Create an offloader writing under `prefix` (no trailing separator).
    pub fn new(storage: std::sync::Arc<dyn RemoteStorage>, prefix: impl Into<String>) -> Self {
        Offloader {
            storage,
            prefix: prefix.into(),
            max_retries: DEFAULT_MAX_REMOTE_RETRIES,
            retry_delay: Duration::from_millis(10),
        }
    }

    /// Override the bounded retry count.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Remote object name of a segment.
    pub fn object_name(&self, segment: u32) -> String {
        format!("{}/{:08}.seg", self.prefix, segment)
    }

    /// Upload a sealed segment file and confirm the backend can see it.
    pub fn upload_segment(&self, segment: u32, local_file: &Path) -> Result<()> {
        let name = self.object_name(segment);
        validate_name(&name)?;
        self.storage.put(&name, local_file)?;
        if !self.storage.exists(&name)? {
            return Err(Error::NotFound(format!(
                "uploaded object {:?} not visible on backend {}",
                name,
                self.storage.kind()
            )));
        }
        debug!(segment, name = %name, "segment offloaded");
        Ok(())
    }

    /// Whether the remote copy of a segment exists.
    pub fn segment_exists(&self, segment: u32) -> Result<bool> {
        self.storage.exists(&self.object_name(segment))
    }

    /// Fetch a byte range of a segment's remote copy, retrying transient
    /// I/O failures a bounded number of times.
    pub fn fetch(&self, segment: u32, offset: u64, size: u64) -> Result<Vec<u8>> {
        let name = self.object_name(segment);
        let mut last_err = None;
        for attempt in 1..=self.max_retries {
            match self.storage.get(&name, offset, size) {
                Ok(bytes) => return Ok(bytes),
                Err(e @ Error::Io(_)) => {
                    warn!(
                        segment,
                        attempt,
                        error = %e,
                        "transient remote fetch failure"
                    );
                    last_err = Some(e);
                    std::thread::sleep(self.retry_delay);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::NotFound(format!("remote object {:?} unavailable", name))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_name_validation() {
        assert!(validate_name("db/vlog/00000001.seg").is_ok());
        assert!(validate_name("/leading").is_err());
        assert!(validate_name("trailing/").is_err());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn test_memory_put_get_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        std::fs::write(&path, b"0123456789").unwrap();

        let storage = MemoryStorage::new();
        storage.put("db/seg", &path).unwrap();
        assert!(storage.exists("db/seg").unwrap());
        assert_eq!(storage.get("db/seg", 2, 4).unwrap(), b"2345");
        assert!(storage.get("db/seg", 8, 4).is_err());
        assert!(matches!(
            storage.get("db/missing", 0, 1),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_memory_listing_is_sorted_and_grouped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        std::fs::write(&path, b"x").unwrap();

        let storage = MemoryStorage::new();
        storage.put("db/vlog/2.seg", &path).unwrap();
        storage.put("db/vlog/1.seg", &path).unwrap();
        storage.put("db/commit/1.seg", &path).unwrap();

        let (entries, prefixes) = checked_list_entries(&storage, "db/").unwrap();
        assert!(entries.is_empty());
        assert_eq!(prefixes, vec!["commit".to_string(), "vlog".to_string()]);

        let (entries, prefixes) = checked_list_entries(&storage, "db/vlog/").unwrap();
        assert_eq!(prefixes.len(), 0);
        assert_eq!(
            entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["1.seg", "2.seg"]
        );
    }

    #[test]
    fn test_offloader_upload_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000001.seg");
        std::fs::write(&path, b"segment-bytes").unwrap();

        let storage = Arc::new(MemoryStorage::new());
        let off = Offloader::new(storage, "db/vlog");
        off.upload_segment(1, &path).unwrap();
        assert!(off.segment_exists(1).unwrap());
        assert_eq!(off.fetch(1, 8, 5).unwrap(), b"bytes");
    }

    #[test]
    fn test_fetch_missing_is_not_retried_forever() {
        let storage = Arc::new(MemoryStorage::new());
        let off = Offloader::new(storage, "db/vlog").with_max_retries(2);
        assert!(matches!(off.fetch(9, 0, 1), Err(Error::NotFound(_))));
    }
}
