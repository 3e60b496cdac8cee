//! Thumbnail bitmap cache with LRU eviction
//!
//! Maps image paths to decoded bitmaps. The number of entries is bounded;
//! once the bound is exceeded the least recently used entries are dropped.
//! Decodes go through a [`DecodePermits`] limiter so only a few run at a time.

use crate::bitmap::{Bitmap, SharedBitmap};
use crate::cancel::CancellationToken;
use crate::config::ThumbnailConfig;
use crate::decode::{is_video_path, FileImageDecoder, ImageDecoder};
use crate::permits::{DecodePermit, DecodePermits};
use crate::recency::{RecencyList, Slot};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Default number of cached thumbnails
pub const DEFAULT_CAPACITY: usize = 200;

/// Default number of simultaneous decodes
pub const DEFAULT_MAX_CONCURRENT_DECODES: usize = 4;

/// Normalize a path into a cache key
///
/// Separators are unified and case is folded, so `C:\Data\A.png` and
/// `c:/data/a.PNG` share one entry.
pub fn cache_key(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}

/// A cached bitmap and the time it was stored
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub bitmap: SharedBitmap,
    pub loaded_at: Instant,
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of thumbnails currently in cache
    pub count: usize,

    /// Maximum number of thumbnails
    pub capacity: usize,

    /// Sum of `width * height * 4` over cached bitmaps
    pub estimated_bytes: usize,

    /// Number of cache hits
    pub hits: u64,

    /// Number of cache misses
    pub misses: u64,

    /// Number of entries dropped to stay within capacity
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Fraction of capacity in use (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.count as f64 / self.capacity as f64
        }
    }
}

/// A cache entry and its place in the recency list
struct Stored {
    entry: CacheEntry,
    slot: Slot,
}

/// Internal cache state
struct CacheState {
    /// Map from cache key to entry
    entries: HashMap<String, Stored>,

    /// Recency order (most recently used at back, least recently used at front)
    access_order: RecencyList,

    /// Maximum number of entries
    capacity: usize,

    /// Running total of estimated bitmap bytes
    estimated_bytes: usize,

    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            access_order: RecencyList::new(),
            capacity,
            estimated_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn lookup(&mut self, key: &str) -> Option<SharedBitmap> {
        match self.entries.get(key) {
            Some(stored) => {
                let bitmap = Arc::clone(&stored.entry.bitmap);
                self.access_order.move_to_back(stored.slot);
                self.hits += 1;
                Some(bitmap)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn insert(&mut self, key: String, bitmap: SharedBitmap) {
        self.remove(&key);

        self.estimated_bytes += bitmap.estimated_bytes();
        let slot = self.access_order.push_back(key.clone());
        self.entries.insert(
            key,
            Stored {
                entry: CacheEntry {
                    bitmap,
                    loaded_at: Instant::now(),
                },
                slot,
            },
        );

        while self.entries.len() > self.capacity {
            if !self.evict_lru() {
                break;
            }
        }
        debug_assert_eq!(self.entries.len(), self.access_order.len());
    }

    /// Drop the least recently used entry
    ///
    /// Only the cache's reference is released; holders of the bitmap keep it.
    fn evict_lru(&mut self) -> bool {
        let Some(key) = self.access_order.pop_front() else {
            return false;
        };
        if let Some(stored) = self.entries.remove(&key) {
            self.estimated_bytes = self
                .estimated_bytes
                .saturating_sub(stored.entry.bitmap.estimated_bytes());
            self.evictions += 1;
        }
        true
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let stored = self.entries.remove(key)?;
        self.access_order.remove(stored.slot);
        self.estimated_bytes = self
            .estimated_bytes
            .saturating_sub(stored.entry.bitmap.estimated_bytes());
        Some(stored.entry)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.access_order.clear();
        self.estimated_bytes = 0;
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            count: self.entries.len(),
            capacity: self.capacity,
            estimated_bytes: self.estimated_bytes,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

/// Thumbnail cache with LRU eviction and bounded decode concurrency
///
/// Thread-safe. Lookups are synchronous and never touch the disk; loads
/// block the calling thread while decoding, so call them from worker threads
/// (the orchestrator in `lora-manager-scheduler` does this for UI callers).
///
/// # Example
///
/// ```
/// use lora_manager_cache::{Bitmap, CancellationToken, ThumbnailCache};
/// use std::path::Path;
/// use std::sync::Arc;
///
/// let decoder = Arc::new(|_path: &Path, width: u32| Some(Bitmap::solid(width, width, [0; 4])));
/// let cache = ThumbnailCache::new(decoder, 200, 4);
///
/// let cancel = CancellationToken::new();
/// let thumb = cache.load(Path::new("dataset/001.png"), 128, &cancel).unwrap();
/// assert_eq!(thumb.width, 128);
///
/// // Served from memory from now on
/// assert!(cache.try_get_cached(Path::new("dataset/001.png")).is_some());
/// ```
pub struct ThumbnailCache {
    state: Mutex<CacheState>,
    permits: DecodePermits,
    decoder: Arc<dyn ImageDecoder>,
}

impl ThumbnailCache {
    /// Create a cache holding at most `capacity` thumbnails, decoding at most
    /// `max_concurrent_decodes` at once
    ///
    /// Both limits are clamped to at least one.
    pub fn new(
        decoder: Arc<dyn ImageDecoder>,
        capacity: usize,
        max_concurrent_decodes: usize,
    ) -> Self {
        Self {
            state: Mutex::new(CacheState::new(capacity.max(1))),
            permits: DecodePermits::new(max_concurrent_decodes),
            decoder,
        }
    }

    /// Create a cache sized from a configuration
    pub fn with_config(decoder: Arc<dyn ImageDecoder>, config: &ThumbnailConfig) -> Self {
        Self::new(decoder, config.capacity, config.max_concurrent_decodes)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a thumbnail without decoding
    ///
    /// A hit marks the entry as most recently used. Empty paths are a miss.
    pub fn try_get_cached(&self, path: &Path) -> Option<SharedBitmap> {
        if path.as_os_str().is_empty() {
            return None;
        }
        self.lock().lookup(&cache_key(path))
    }

    /// Check if a thumbnail is cached without updating recency
    pub fn contains(&self, path: &Path) -> bool {
        self.lock().entries.contains_key(&cache_key(path))
    }

    /// Store a bitmap, evicting the least recently used entries past capacity
    pub fn insert(&self, path: &Path, bitmap: SharedBitmap) {
        self.lock().insert(cache_key(path), bitmap);
    }

    /// Return the cached thumbnail or decode it
    ///
    /// Waits for a decode permit first. Every failure, and cancellation while
    /// waiting or decoding, yields `None`.
    pub fn load(
        &self,
        path: &Path,
        target_width: u32,
        cancel: &CancellationToken,
    ) -> Option<SharedBitmap> {
        if path.as_os_str().is_empty() || cancel.is_cancelled() {
            return None;
        }
        if let Some(bitmap) = self.try_get_cached(path) {
            return Some(bitmap);
        }
        if is_video_path(path) {
            return Some(self.store_placeholder(path, target_width));
        }

        let permit = self.permits.acquire(cancel)?;
        self.load_with_permit(path, target_width, cancel, permit)
    }

    /// Decode using a permit the caller already holds
    ///
    /// The permit is released as soon as the decoder returns.
    pub fn load_with_permit(
        &self,
        path: &Path,
        target_width: u32,
        cancel: &CancellationToken,
        permit: DecodePermit,
    ) -> Option<SharedBitmap> {
        if path.as_os_str().is_empty() || cancel.is_cancelled() {
            return None;
        }
        // Another permit holder may have finished this path while we waited
        if let Some(bitmap) = self.try_get_cached(path) {
            return Some(bitmap);
        }
        if is_video_path(path) {
            return Some(self.store_placeholder(path, target_width));
        }

        let decoded = self.decode(path, target_width);
        drop(permit);

        let bitmap = decoded.filter(|bitmap| !bitmap.is_empty())?.into_shared();
        self.insert(path, Arc::clone(&bitmap));

        if cancel.is_cancelled() {
            return None;
        }
        Some(bitmap)
    }

    fn decode(&self, path: &Path, target_width: u32) -> Option<Bitmap> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.decoder.decode(path, target_width))) {
            Ok(decoded) => decoded,
            Err(_) => {
                log::warn!("thumbnail decoder panicked on {}", path.display());
                None
            }
        }
    }

    fn store_placeholder(&self, path: &Path, target_width: u32) -> SharedBitmap {
        let bitmap = Bitmap::video_placeholder(target_width).into_shared();
        self.insert(path, Arc::clone(&bitmap));
        bitmap
    }

    /// Remove a thumbnail from the cache
    ///
    /// Returns `true` if an entry was removed. The bitmap itself stays alive
    /// for anyone still holding it.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.lock().remove(&cache_key(path)).is_some()
    }

    /// Remove all thumbnails
    pub fn clear_cache(&self) {
        self.lock().clear();
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        self.lock().stats()
    }

    /// Number of cached thumbnails
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Maximum number of cached thumbnails
    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// The decode concurrency limiter
    pub fn permits(&self) -> &DecodePermits {
        &self.permits
    }

    /// Cached keys from least to most recently used
    pub fn access_order(&self) -> Vec<String> {
        self.lock().access_order.iter().map(str::to_string).collect()
    }
}

impl Default for ThumbnailCache {
    /// File-backed cache with the default limits
    fn default() -> Self {
        Self::new(
            Arc::new(FileImageDecoder::new()),
            DEFAULT_CAPACITY,
            DEFAULT_MAX_CONCURRENT_DECODES,
        )
    }
}
