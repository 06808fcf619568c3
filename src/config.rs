//! Pipeline configuration: behavior flags and pool sizes in
//! [`PipelineConfig`], pluggable capabilities in [`PipelineServices`].

use crate::cache::{ImageCache, MemoryImageCache};
use crate::decode::{standard_decoder_selector, DecoderSelector};
use crate::loader::DataLoader;
use crate::process::{request_processor_selector, ProcessorSelector};
use crate::rate_limiter::RateLimit;
use crate::resumable::{DEFAULT_RESUMABLE_CACHE_BYTES, DEFAULT_RESUMABLE_CACHE_ENTRIES};
use std::sync::Arc;

/// Behavior flags and sizing knobs for [`crate::ImagePipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Coalesce equivalent in-flight requests into one session.
    pub deduplication_enabled: bool,
    /// Throttle new fetch starts through the token bucket.
    pub rate_limiter_enabled: bool,
    /// Deliver partially decoded images while bytes are still arriving.
    pub progressive_decoding_enabled: bool,
    /// Save and reuse partial bytes across interrupted downloads.
    pub resumable_data_enabled: bool,
    /// Fetch pool size.
    pub fetch_concurrency: usize,
    /// Processing pool size.
    pub processing_concurrency: usize,
    /// Replenishment parameters used when the rate limiter is enabled.
    pub rate_limit: RateLimit,
    /// Byte budget for the resumable-data cache.
    pub resumable_cache_bytes: usize,
    /// Entry-count bound for the resumable-data cache.
    pub resumable_cache_entries: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deduplication_enabled: true,
            rate_limiter_enabled: false,
            progressive_decoding_enabled: false,
            resumable_data_enabled: true,
            fetch_concurrency: 6,
            processing_concurrency: 2,
            rate_limit: RateLimit::default(),
            resumable_cache_bytes: DEFAULT_RESUMABLE_CACHE_BYTES,
            resumable_cache_entries: DEFAULT_RESUMABLE_CACHE_ENTRIES,
        }
    }
}

impl PipelineConfig {
    pub fn with_deduplication(mut self, enabled: bool) -> Self {
        self.deduplication_enabled = enabled;
        self
    }

    pub fn with_rate_limiter(mut self, enabled: bool) -> Self {
        self.rate_limiter_enabled = enabled;
        self
    }

    pub fn with_progressive_decoding(mut self, enabled: bool) -> Self {
        self.progressive_decoding_enabled = enabled;
        self
    }

    pub fn with_resumable_data(mut self, enabled: bool) -> Self {
        self.resumable_data_enabled = enabled;
        self
    }

    pub fn with_fetch_concurrency(mut self, workers: usize) -> Self {
        self.fetch_concurrency = workers;
        self
    }

    pub fn with_processing_concurrency(mut self, workers: usize) -> Self {
        self.processing_concurrency = workers;
        self
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = limit;
        self
    }
}

/// The pluggable capabilities the pipeline orchestrates.
///
/// Only the data loader is mandatory; the result cache, decoder selector,
/// and processor selector default to the in-crate implementations.
#[derive(Clone)]
pub struct PipelineServices {
    pub loader: Arc<dyn DataLoader>,
    pub image_cache: Arc<dyn ImageCache>,
    pub decoder_selector: DecoderSelector,
    pub processor_selector: ProcessorSelector,
}

impl PipelineServices {
    pub fn new(loader: Arc<dyn DataLoader>) -> Self {
        Self {
            loader,
            image_cache: Arc::new(MemoryImageCache::default()),
            decoder_selector: standard_decoder_selector(),
            processor_selector: request_processor_selector(),
        }
    }

    pub fn with_image_cache(mut self, cache: Arc<dyn ImageCache>) -> Self {
        self.image_cache = cache;
        self
    }

    pub fn with_decoder_selector(mut self, selector: DecoderSelector) -> Self {
        self.decoder_selector = selector;
        self
    }

    pub fn with_processor_selector(mut self, selector: ProcessorSelector) -> Self {
        self.processor_selector = selector;
        self
    }
}
