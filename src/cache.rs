//! Result cache: the final-image store probed before any session is created.
//!
//! The pipeline consumes an [`ImageCache`] capability keyed by the
//! normalized request; [`MemoryImageCache`] is the in-crate default, an
//! LRU bounded by estimated bitmap cost.

use crate::decode::DecodedImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Default capacity for the in-memory result cache.
pub const DEFAULT_IMAGE_CACHE_BYTES: usize = 256 * 1024 * 1024;

/// The result-cache capability consumed by the pipeline.
///
/// Keys are normalized request identities ([`crate::ImageRequest::cache_key`]).
/// Per-request read/write permission flags are enforced by the pipeline, not
/// by implementations.
pub trait ImageCache: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<DecodedImage>;

    fn set(&self, key: String, image: DecodedImage);
}

/// Entry in the memory cache.
struct CacheEntry {
    image: DecodedImage,
    cost: usize,
    /// Last access time for LRU eviction.
    last_accessed: Instant,
}

/// Hit/miss statistics snapshot.
#[derive(Debug, Default, Clone)]
pub struct ImageCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// In-memory LRU cache for decoded images.
///
/// Bounded by the summed byte cost of stored bitmaps
/// (`width * height * 4` per entry). Eviction removes least-recently
/// accessed entries until the new entry fits.
pub struct MemoryImageCache {
    state: Mutex<CacheState>,
    max_cost: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    total_cost: usize,
}

impl MemoryImageCache {
    /// Creates a cache bounded by `max_cost` estimated bytes.
    pub fn new(max_cost: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                total_cost: 0,
            }),
            max_cost,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn total_cost(&self) -> usize {
        self.state.lock().unwrap().total_cost
    }

    pub fn stats(&self) -> ImageCacheStats {
        ImageCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Evicts LRU entries until `needed` additional bytes fit.
    fn evict_until_fits(&self, state: &mut CacheState, needed: usize) {
        while state.total_cost + needed > self.max_cost && !state.entries.is_empty() {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, _)| key.clone());

            if let Some(key) = oldest {
                if let Some(entry) = state.entries.remove(&key) {
                    state.total_cost -= entry.cost;
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_CACHE_BYTES)
    }
}

impl ImageCache for MemoryImageCache {
    fn get(&self, key: &str) -> Option<DecodedImage> {
        let mut state = self.state.lock().unwrap();

        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_accessed = Instant::now();
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.image.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    fn set(&self, key: String, image: DecodedImage) {
        let cost = image.byte_cost();
        if cost > self.max_cost {
            // Larger than the whole cache; storing it would evict everything
            // for nothing.
            return;
        }

        let mut state = self.state.lock().unwrap();

        if let Some(previous) = state.entries.remove(&key) {
            state.total_cost -= previous.cost;
        }
        self.evict_until_fits(&mut state, cost);

        state.entries.insert(
            key,
            CacheEntry {
                image,
                cost,
                last_accessed: Instant::now(),
            },
        );
        state.total_cost += cost;
    }
}
