use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use log::trace;
use parking_lot::Mutex;

use super::MetadataRecord;

pub const DEFAULT_CACHE_CAPACITY: usize = 10;

/// The canonical form of `path`, or `path` itself when it cannot be resolved
fn canonical_path(path: PathBuf) -> PathBuf {
    fs::canonicalize(&path).unwrap_or(path)
}

/// Identifies a cached record: a file, optionally one dataset within it, and whether
/// sidecar files were merged into the record.
///
/// Paths are canonicalized when they resolve, so the same file reached through
/// different relative paths shares its entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: PathBuf,
    pub dataset: Option<usize>,
    pub sidecars: bool,
}

impl CacheKey {
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: canonical_path(path.into()),
            dataset: None,
            sidecars: true,
        }
    }

    pub fn dataset<P: Into<PathBuf>>(path: P, dataset: usize) -> Self {
        Self {
            path: canonical_path(path.into()),
            dataset: Some(dataset),
            sidecars: true,
        }
    }

    /// Key a record read with sidecars enabled or disabled
    pub fn with_sidecars(mut self, sidecars: bool) -> Self {
        self.sidecars = sidecars;
        self
    }
}

/// A bounded least-recently-used cache of [`MetadataRecord`]s.
///
/// Entries are never invalidated on their own. If a file changes on disk after
/// its record was cached, the stale record is served until [`MetadataCache::invalidate`]
/// or [`MetadataCache::clear`] is called.
#[derive(Debug)]
pub struct MetadataCache {
    capacity: usize,
    // Least recently used entry at the front
    entries: Mutex<IndexMap<CacheKey, Arc<MetadataRecord>>>,
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

static GLOBAL_CACHE: OnceLock<MetadataCache> = OnceLock::new();

impl MetadataCache {
    /// Create a cache holding at most `capacity` records. A capacity of zero
    /// disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(IndexMap::with_capacity(capacity)),
        }
    }

    /// The process-wide cache shared by ingestions that were not given their own
    pub fn global() -> &'static MetadataCache {
        GLOBAL_CACHE.get_or_init(MetadataCache::default)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Look up a record, marking it as most recently used
    pub fn get(&self, key: &CacheKey) -> Option<Arc<MetadataRecord>> {
        let mut entries = self.entries.lock();
        let record = entries.shift_remove(key)?;
        entries.insert(key.clone(), record.clone());
        Some(record)
    }

    /// Store a record, evicting the least recently used entries beyond capacity
    pub fn insert(&self, key: CacheKey, record: Arc<MetadataRecord>) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        entries.shift_remove(&key);
        entries.insert(key, record);
        while entries.len() > self.capacity {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                trace!("Evicting metadata for {}", evicted.path.display());
            }
        }
    }

    /// Return the cached record for `key`, or build it with `load`, cache it and
    /// return it. Failures are not cached.
    ///
    /// The lock is not held while `load` runs.
    pub fn get_or_try_insert_with<E, F: FnOnce() -> Result<MetadataRecord, E>>(
        &self,
        key: CacheKey,
        load: F,
    ) -> Result<Arc<MetadataRecord>, E> {
        if let Some(record) = self.get(&key) {
            trace!("Metadata cache hit for {}", key.path.display());
            return Ok(record);
        }
        let record = Arc::new(load()?);
        self.insert(key, record.clone());
        Ok(record)
    }

    /// Drop every record for `path`, including per-dataset records and records read
    /// with and without sidecars
    pub fn invalidate<P: AsRef<Path>>(&self, path: P) -> usize {
        let path = canonical_path(path.as_ref().to_path_buf());
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| k.path != path);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
