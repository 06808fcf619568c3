//! Request model: what to load, how urgently, and under which cache policy.

use crate::process::ImageProcessor;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Priority level for scheduling fetch and processing work.
///
/// Ordered: `VeryLow < Low < Normal < High < VeryHigh`. A session's
/// effective priority is always the maximum across its current subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    /// Speculative work, e.g. off-screen prefetch.
    VeryLow = 0,
    /// Background loading.
    Low = 1,
    /// Standard requests.
    #[default]
    Normal = 2,
    /// Requests for visible content.
    High = 3,
    /// Requests the caller is actively blocked on.
    VeryHigh = 4,
}

impl Priority {
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Priority::VeryLow,
            1 => Priority::Low,
            2 => Priority::Normal,
            3 => Priority::High,
            _ => Priority::VeryHigh,
        }
    }
}

/// A live priority cell shared between a session and its queued work.
///
/// Queue workers read the cell when choosing the next item, so updating it
/// re-orders work that is already queued without touching the queue itself.
#[derive(Clone)]
pub(crate) struct SharedPriority(Arc<AtomicU8>);

impl SharedPriority {
    pub(crate) fn new(priority: Priority) -> Self {
        Self(Arc::new(AtomicU8::new(priority.as_u8())))
    }

    pub(crate) fn get(&self) -> Priority {
        Priority::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn set(&self, priority: Priority) {
        self.0.store(priority.as_u8(), Ordering::Relaxed);
    }
}

/// Memory-cache read/write permissions for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// May the pipeline serve this request from the result cache?
    pub read_allowed: bool,
    /// May the pipeline store this request's result in the cache?
    pub write_allowed: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            read_allowed: true,
            write_allowed: true,
        }
    }
}

impl CachePolicy {
    /// Neither reads nor writes the result cache.
    pub fn disabled() -> Self {
        Self {
            read_allowed: false,
            write_allowed: false,
        }
    }
}

/// A request to load, decode, and optionally transform one image.
///
/// Immutable after creation except for priority, which may be raised or
/// lowered while the request is in flight.
#[derive(Clone)]
pub struct ImageRequest {
    /// Resource locator handed to the data loader.
    pub url: String,
    /// Scheduling priority.
    pub priority: Priority,
    /// Optional transform applied after decoding.
    pub processor: Option<Arc<dyn ImageProcessor>>,
    /// Result-cache permissions.
    pub cache_policy: CachePolicy,
}

impl ImageRequest {
    /// Creates a request with default priority and cache policy.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            priority: Priority::default(),
            processor: None,
            cache_policy: CachePolicy::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn ImageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Normalized result-cache key: the URL plus the processor identity, so
    /// differently-processed variants of one resource never collide.
    pub fn cache_key(&self) -> String {
        match &self.processor {
            Some(processor) => format!("{}#{}", self.url, processor.id()),
            None => self.url.clone(),
        }
    }
}

impl std::fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRequest")
            .field("url", &self.url)
            .field("priority", &self.priority)
            .field("processor", &self.processor.as_ref().map(|p| p.id()))
            .field("cache_policy", &self.cache_policy)
            .finish()
    }
}

static UNIQUE_KEY_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity under which concurrent requests share one session.
///
/// With deduplication enabled, equivalent requests map to the same
/// `Shared` key and attach to one in-flight session. With deduplication
/// disabled every request gets a fresh `Unique` key: no sharing, but the
/// same session bookkeeping machinery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Shared(String),
    Unique(u64),
}

impl SessionKey {
    pub(crate) fn for_request(request: &ImageRequest, deduplication_enabled: bool) -> Self {
        if deduplication_enabled {
            SessionKey::Shared(request.cache_key())
        } else {
            SessionKey::Unique(UNIQUE_KEY_COUNTER.fetch_add(1, Ordering::Relaxed))
        }
    }
}
