//! Size-bounded image and favicon cache.
//!
//! Blobs live on disk under `images/`, named by the SHA-256 of their key, with
//! a small in-memory LRU tier in front. The index (size, logical access tick,
//! wall-clock access time) is kept in memory and mirrored to the store's
//! `cached_images` table so eviction order survives restarts.

use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use crate::storage::{CachedImageRecord, Store, StoreError};

const TEMP_SUFFIX: &str = ".tmp";

/// Identifies one cached image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageKey {
    Favicon(String),
    StoryImage { story_hash: String, index: u32 },
}

impl ImageKey {
    /// Key as stored in the index (`favicon:{feed}` / `story:{hash}:{index}`).
    pub fn storage_key(&self) -> String {
        match self {
            ImageKey::Favicon(feed_id) => format!("favicon:{feed_id}"),
            ImageKey::StoryImage { story_hash, index } => format!("story:{story_hash}:{index}"),
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        if let Some(feed_id) = key.strip_prefix("favicon:") {
            return Some(ImageKey::Favicon(feed_id.to_string()));
        }
        let rest = key.strip_prefix("story:")?;
        let (story_hash, index) = rest.rsplit_once(':')?;
        Some(ImageKey::StoryImage {
            story_hash: story_hash.to_string(),
            index: index.parse().ok()?,
        })
    }

    fn file_name(storage_key: &str) -> String {
        hex::encode(Sha256::digest(storage_key.as_bytes()))
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[derive(Debug, Error)]
pub enum ImageCacheError {
    #[error("Image cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image of {size} bytes exceeds the cache budget of {budget} bytes")]
    TooLarge { size: u64, budget: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ImageCacheSettings {
    /// Total bytes on disk
    pub max_bytes: u64,
    /// Total number of cached images
    pub max_entries: usize,
    /// Blobs kept in memory
    pub memory_entries: usize,
}

impl Default for ImageCacheSettings {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            max_entries: 10_000,
            memory_entries: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub max_bytes: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    size: u64,
    tick: u64,
    accessed_at: i64,
}

/// In-memory index. Ticks are unique, so `order` is a total recency order.
#[derive(Default)]
struct Index {
    entries: HashMap<String, IndexEntry>,
    order: BTreeMap<u64, String>,
    total_bytes: u64,
    next_tick: u64,
    touched: HashSet<String>,
}

impl Index {
    fn next_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn insert(&mut self, key: &str, size: u64, accessed_at: i64) -> IndexEntry {
        self.remove(key);
        let entry = IndexEntry {
            size,
            tick: self.next_tick(),
            accessed_at,
        };
        self.entries.insert(key.to_string(), entry);
        self.order.insert(entry.tick, key.to_string());
        self.total_bytes += size;
        entry
    }

    /// Load a persisted entry, keeping its tick so order survives restarts.
    fn restore(&mut self, record: &CachedImageRecord) {
        self.remove(&record.key);
        let tick = if self.order.contains_key(&record.tick) {
            self.next_tick()
        } else {
            record.tick
        };
        self.next_tick = self.next_tick.max(tick + 1);
        self.entries.insert(
            record.key.clone(),
            IndexEntry {
                size: record.size,
                tick,
                accessed_at: record.accessed_at,
            },
        );
        self.order.insert(tick, record.key.clone());
        self.total_bytes += record.size;
    }

    fn touch(&mut self, key: &str, accessed_at: i64) {
        let tick = self.next_tick();
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        self.order.remove(&entry.tick);
        entry.tick = tick;
        entry.accessed_at = accessed_at;
        self.order.insert(tick, key.to_string());
        self.touched.insert(key.to_string());
    }

    fn remove(&mut self, key: &str) -> Option<IndexEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        self.touched.remove(key);
        Some(entry)
    }

    /// Evict least recently used entries until both budgets hold.
    fn evict_over_budget(&mut self, max_bytes: u64, max_entries: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.total_bytes > max_bytes || self.entries.len() > max_entries {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.total_bytes = self.total_bytes.saturating_sub(entry.size);
            }
            self.touched.remove(&key);
            evicted.push(key);
        }
        evicted
    }

    fn record(&self, key: &str) -> Option<CachedImageRecord> {
        self.entries.get(key).map(|e| CachedImageRecord {
            key: key.to_string(),
            size: e.size,
            tick: e.tick,
            accessed_at: e.accessed_at,
        })
    }
}

/// Disk-backed image cache with LRU eviction under byte and count budgets.
pub struct ImageCache {
    dir: PathBuf,
    store: Store,
    settings: ImageCacheSettings,
    index: Mutex<Index>,
    memory: Mutex<LruCache<String, Arc<Vec<u8>>>>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImageCache {
    /// Open the cache in `dir`, reloading the index from the store.
    ///
    /// Entries whose file is missing are dropped, leftover temp files are
    /// removed and the budgets are enforced against the reloaded index.
    pub async fn open(
        dir: impl AsRef<Path>,
        store: Store,
        settings: ImageCacheSettings,
    ) -> Result<Self, ImageCacheError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        remove_temp_files(&dir).await;

        let mut index = Index::default();
        let mut missing = Vec::new();
        for record in store.load_cached_images().await? {
            let path = dir.join(ImageKey::file_name(&record.key));
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                missing.push(record.key);
                continue;
            }
            index.restore(&record);
        }
        if !missing.is_empty() {
            tracing::info!(count = missing.len(), "Dropping cached images with missing files");
            store.delete_cached_images(&missing).await?;
            for key in &missing {
                mark_uncached(&store, key).await;
            }
        }

        let memory = LruCache::new(
            NonZeroUsize::new(settings.memory_entries).unwrap_or(NonZeroUsize::MIN),
        );
        let cache = Self {
            dir,
            store,
            settings,
            index: Mutex::new(index),
            memory: Mutex::new(memory),
            key_locks: Mutex::new(HashMap::new()),
        };

        let evicted = {
            let mut index = cache.lock_index();
            index.evict_over_budget(cache.settings.max_bytes, cache.settings.max_entries)
        };
        cache.discard(&evicted).await?;

        let stats = cache.stats();
        tracing::debug!(entries = stats.entries, bytes = stats.bytes, "Image cache opened");
        Ok(cache)
    }

    /// Store a blob, evicting least recently used images to stay in budget.
    ///
    /// # Arguments
    ///
    /// * `key` - Which image this is; story images are also marked cached on
    ///   their story so prefetch skips them
    /// * `blob` - The raw bytes, written to disk as-is
    ///
    /// # Errors
    ///
    /// Returns [`ImageCacheError::TooLarge`] if the blob alone exceeds the byte
    /// budget, [`ImageCacheError::Io`] if the file cannot be written and
    /// [`ImageCacheError::Store`] if the index row cannot be saved.
    pub async fn put(&self, key: &ImageKey, blob: Vec<u8>) -> Result<(), ImageCacheError> {
        let size = blob.len() as u64;
        if size > self.settings.max_bytes {
            return Err(ImageCacheError::TooLarge {
                size,
                budget: self.settings.max_bytes,
            });
        }

        let storage_key = key.storage_key();
        let lock = self.key_lock(&storage_key);
        let guard = lock.lock().await;
        let (evicted, result) = self.put_locked(key, &storage_key, blob).await;
        drop(guard);
        drop(lock);
        self.release_key_lock(&storage_key);

        // Victims are discarded under their own key lock, never while holding ours.
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "Evicted cached images");
        }
        let discarded = self.discard(&evicted).await;
        result.and(discarded)
    }

    /// Write the file and index it. Returns the keys evicted to make room even
    /// when saving the index row fails afterwards.
    async fn put_locked(
        &self,
        key: &ImageKey,
        storage_key: &str,
        blob: Vec<u8>,
    ) -> (Vec<String>, Result<(), ImageCacheError>) {
        let size = blob.len() as u64;
        let path = self.path_for(storage_key);
        let temp = path.with_extension(&TEMP_SUFFIX[1..]);

        if let Err(e) = tokio::fs::write(&temp, &blob).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return (Vec::new(), Err(e.into()));
        }
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return (Vec::new(), Err(e.into()));
        }

        let (record, evicted) = {
            let mut index = self.lock_index();
            index.insert(storage_key, size, unix_now());
            let evicted =
                index.evict_over_budget(self.settings.max_bytes, self.settings.max_entries);
            (index.record(storage_key), evicted)
        };
        self.lock_memory().put(storage_key.to_string(), Arc::new(blob));

        let result = async {
            if let Some(record) = record {
                self.store.upsert_cached_image(&record).await?;
            }
            if let ImageKey::StoryImage { story_hash, index } = key {
                self.store
                    .mark_story_image_cached(story_hash, *index, true)
                    .await?;
            }
            Ok::<(), ImageCacheError>(())
        }
        .await;
        (evicted, result)
    }

    /// Look up an image. A miss is `None`, including a file that vanished
    /// under eviction.
    pub async fn get(&self, key: &ImageKey) -> Option<Arc<Vec<u8>>> {
        let storage_key = key.storage_key();

        let cached = self.lock_memory().get(&storage_key).cloned();
        if let Some(blob) = cached {
            self.lock_index().touch(&storage_key, unix_now());
            return Some(blob);
        }

        if !self.lock_index().entries.contains_key(&storage_key) {
            return None;
        }

        match tokio::fs::read(self.path_for(&storage_key)).await {
            Ok(bytes) => {
                let blob = Arc::new(bytes);
                // Evicted while we were reading
                if !self.lock_index().entries.contains_key(&storage_key) {
                    return Some(blob);
                }
                self.lock_memory().put(storage_key.clone(), Arc::clone(&blob));
                self.lock_index().touch(&storage_key, unix_now());
                Some(blob)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.forget_missing(&storage_key).await;
                None
            }
            Err(e) => {
                tracing::warn!(key = %storage_key, error = %e, "Failed to read cached image");
                None
            }
        }
    }

    pub fn contains(&self, key: &ImageKey) -> bool {
        self.lock_index()
            .entries
            .contains_key(&key.storage_key())
    }

    /// Empty memory, disk and index. The cache stays usable.
    pub async fn remove_all(&self) -> Result<usize, ImageCacheError> {
        let count = {
            let mut index = self.lock_index();
            let count = index.entries.len();
            let next_tick = index.next_tick;
            *index = Index {
                next_tick,
                ..Index::default()
            };
            count
        };
        self.lock_memory().clear();

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove cached image");
                }
            }
        }
        self.store.clear_cached_images().await?;

        tracing::info!(count, "Cleared image cache");
        Ok(count)
    }

    /// Evict images not accessed within `max_age`.
    pub async fn cleanup(&self, max_age: Duration) -> Result<usize, ImageCacheError> {
        let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let cutoff = unix_now().saturating_sub(max_age);
        let expired: Vec<String> = {
            let mut index = self.lock_index();
            let keys: Vec<String> = index
                .entries
                .iter()
                .filter(|(_, e)| e.accessed_at < cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                index.remove(key);
            }
            keys
        };

        self.discard(&expired).await?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Removed stale cached images");
        }
        Ok(expired.len())
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.lock_index();
        CacheStats {
            entries: index.entries.len(),
            bytes: index.total_bytes,
            max_bytes: self.settings.max_bytes,
            max_entries: self.settings.max_entries,
        }
    }

    /// Write access order changed by `get` back to the store.
    pub async fn persist_access(&self) -> Result<usize, ImageCacheError> {
        let records: Vec<CachedImageRecord> = {
            let mut index = self.lock_index();
            let touched: Vec<String> = index.touched.drain().collect();
            touched.iter().filter_map(|k| index.record(k)).collect()
        };
        self.store.touch_cached_images(&records).await?;
        Ok(records.len())
    }

    /// Remove evicted entries from memory, disk and the store. The index
    /// already forgot them.
    ///
    /// Each key is handled under its own lock and skipped if a put indexed it
    /// again in the meantime, so a fresh file is never deleted.
    async fn discard(&self, keys: &[String]) -> Result<(), ImageCacheError> {
        let mut first_error = None;
        for key in keys {
            let lock = self.key_lock(key);
            let guard = lock.lock().await;
            let result = self.discard_locked(key).await;
            drop(guard);
            drop(lock);
            self.release_key_lock(key);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn discard_locked(&self, key: &str) -> Result<(), ImageCacheError> {
        if self.lock_index().entries.contains_key(key) {
            tracing::trace!(key = %key, "Image cached again before eviction finished");
            return Ok(());
        }

        self.lock_memory().pop(key);
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "Failed to delete evicted image"),
        }
        self.store.delete_cached_images(&[key.to_string()]).await?;
        mark_uncached(&self.store, key).await;
        Ok(())
    }

    /// Drop an indexed entry whose file is gone.
    async fn forget_missing(&self, storage_key: &str) {
        let lock = self.key_lock(storage_key);
        let guard = lock.lock().await;
        let missing = !tokio::fs::try_exists(self.path_for(storage_key))
            .await
            .unwrap_or(false);
        let forgotten = missing && self.lock_index().remove(storage_key).is_some();
        if forgotten {
            self.lock_memory().pop(storage_key);
            if let Err(e) = self
                .store
                .delete_cached_images(&[storage_key.to_string()])
                .await
            {
                tracing::warn!(key = %storage_key, error = %e, "Failed to drop index row of missing image");
            }
            mark_uncached(&self.store, storage_key).await;
        }
        drop(guard);
        drop(lock);
        self.release_key_lock(storage_key);
    }

    fn path_for(&self, storage_key: &str) -> PathBuf {
        self.dir.join(ImageKey::file_name(storage_key))
    }

    fn key_lock(&self, storage_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock(&self.key_locks);
        Arc::clone(locks.entry(storage_key.to_string()).or_default())
    }

    fn release_key_lock(&self, storage_key: &str) {
        let mut locks = lock(&self.key_locks);
        if locks
            .get(storage_key)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(storage_key);
        }
    }

    fn lock_index(&self) -> MutexGuard<'_, Index> {
        lock(&self.index)
    }

    fn lock_memory(&self) -> MutexGuard<'_, LruCache<String, Arc<Vec<u8>>>> {
        lock(&self.memory)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Story images that leave the cache become eligible for prefetch again.
async fn mark_uncached(store: &Store, storage_key: &str) {
    if let Some(ImageKey::StoryImage { story_hash, index }) = ImageKey::parse(storage_key) {
        if let Err(e) = store.mark_story_image_cached(&story_hash, index, false).await {
            tracing::warn!(key = %storage_key, error = %e, "Failed to reset story image state");
        }
    }
}

async fn remove_temp_files(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX) {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}
