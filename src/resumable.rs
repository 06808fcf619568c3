//! Resumable-download cache: partial bytes saved across failed attempts.
//!
//! When a fetch fails or is cancelled after delivering some bytes, the
//! pipeline saves what it has — together with a response validator — so the
//! *next* request for the same resource can ask the server to continue from
//! where the last one stopped. Resumption is opportunistic: nothing here is
//! retried; the saved entry just rides along on the next attempt.
//!
//! Entries are consumed on read (`take`) so a resumed attempt either
//! finishes the download or, on its own failure, re-saves the accumulated
//! bytes. The cache is bounded by total byte cost and entry count with LRU
//! eviction.

use crate::loader::ResponseInfo;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Default byte budget for saved partial downloads.
pub const DEFAULT_RESUMABLE_CACHE_BYTES: usize = 32 * 1024 * 1024;

/// Default entry-count bound.
pub const DEFAULT_RESUMABLE_CACHE_ENTRIES: usize = 100;

/// Response validator proving the partial bytes are still current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validator {
    ETag(String),
    LastModified(String),
}

impl Validator {
    /// Extracts a validator from response metadata, preferring the ETag.
    /// Weak ETags cannot validate byte ranges and are skipped.
    pub fn from_response(response: &ResponseInfo) -> Option<Self> {
        if let Some(etag) = &response.etag {
            if !etag.starts_with("W/") {
                return Some(Validator::ETag(etag.clone()));
            }
        }
        response
            .last_modified
            .as_ref()
            .map(|lm| Validator::LastModified(lm.clone()))
    }

    fn header_value(&self) -> &str {
        match self {
            Validator::ETag(value) => value,
            Validator::LastModified(value) => value,
        }
    }
}

/// Partial bytes from an interrupted download, plus what is needed to
/// continue it.
#[derive(Debug, Clone)]
pub struct ResumableData {
    pub data: Bytes,
    pub validator: Validator,
    /// Full expected length of the resource, when the original response
    /// declared one.
    pub total_length: Option<u64>,
}

impl ResumableData {
    /// Builds a resumable record from an interrupted session's state.
    ///
    /// Returns `None` when resumption is impossible: no bytes, no usable
    /// validator, or a server that does not accept byte ranges.
    pub fn new(data: Bytes, response: &ResponseInfo, total_length: Option<u64>) -> Option<Self> {
        if data.is_empty() || !response.supports_byte_ranges() {
            return None;
        }
        let validator = Validator::from_response(response)?;
        Some(Self {
            data,
            validator,
            total_length,
        })
    }

    /// Conditional-request headers asking the server to continue from the
    /// saved offset.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        vec![
            ("Range".to_string(), format!("bytes={}-", self.data.len())),
            (
                "If-Range".to_string(),
                self.validator.header_value().to_string(),
            ),
        ]
    }

    /// True when the first response of the resumed attempt confirms the
    /// server honored the range request.
    pub fn is_confirmed_by(&self, response: &ResponseInfo) -> bool {
        response.is_partial_content()
    }
}

struct StoredEntry {
    data: ResumableData,
    last_accessed: Instant,
}

/// Statistics snapshot for resumable-data effectiveness.
#[derive(Debug, Default, Clone)]
pub struct ResumableCacheStats {
    pub stores: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bounded cache of [`ResumableData`], keyed by resource identity (URL).
///
/// The key is deliberately independent of the coalescing key: resumability
/// is about bytes on the wire, not about request equivalence.
pub struct ResumableDataCache {
    state: Mutex<CacheState>,
    max_total_bytes: usize,
    max_entries: usize,
    stores: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

struct CacheState {
    entries: HashMap<String, StoredEntry>,
    total_bytes: usize,
}

impl ResumableDataCache {
    pub fn new(max_total_bytes: usize, max_entries: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                total_bytes: 0,
            }),
            max_total_bytes,
            max_entries,
            stores: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Removes and returns the entry for `key`, if present.
    ///
    /// Consumption is single-use: the caller either completes the resumed
    /// download or re-stores whatever it accumulated.
    pub fn take(&self, key: &str) -> Option<ResumableData> {
        let mut state = self.state.lock().unwrap();

        match state.entries.remove(key) {
            Some(entry) => {
                state.total_bytes -= entry.data.data.len();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.data)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores (or replaces) the entry for `key`, evicting LRU entries to
    /// honor the byte and entry bounds. Oversized payloads are dropped.
    pub fn store(&self, key: String, data: ResumableData) {
        let cost = data.data.len();
        if cost > self.max_total_bytes {
            return;
        }

        let mut state = self.state.lock().unwrap();

        if let Some(previous) = state.entries.remove(&key) {
            state.total_bytes -= previous.data.data.len();
        }

        while (state.total_bytes + cost > self.max_total_bytes
            || state.entries.len() >= self.max_entries)
            && !state.entries.is_empty()
        {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(k, _)| k.clone());

            if let Some(oldest_key) = oldest {
                if let Some(entry) = state.entries.remove(&oldest_key) {
                    state.total_bytes -= entry.data.data.len();
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        state.total_bytes += cost;
        state.entries.insert(
            key,
            StoredEntry {
                data,
                last_accessed: Instant::now(),
            },
        );
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().unwrap().total_bytes
    }

    pub fn stats(&self) -> ResumableCacheStats {
        ResumableCacheStats {
            stores: self.stores.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for ResumableDataCache {
    fn default() -> Self {
        Self::new(DEFAULT_RESUMABLE_CACHE_BYTES, DEFAULT_RESUMABLE_CACHE_ENTRIES)
    }
}
