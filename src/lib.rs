//! pixelpipe - coalescing image-loading pipeline.
//!
//! Given a request (location plus processing and priority options), the
//! pipeline fetches raw bytes, decodes them into a bitmap, optionally
//! transforms it, and delivers the result to every caller — while turning N
//! identical in-flight requests into at most one underlying fetch/decode/
//! process chain, bounding system load, and surviving interrupted downloads.
//!
//! # Quick start
//!
//! ```ignore
//! use pixelpipe::{ImagePipeline, ImageRequest, PipelineConfig, PipelineServices, TaskCallbacks};
//! use std::sync::Arc;
//!
//! let services = PipelineServices::new(Arc::new(my_loader));
//! let pipeline = ImagePipeline::new(services, PipelineConfig::default());
//!
//! let task = pipeline.submit(
//!     ImageRequest::new("https://example.com/photo.jpg"),
//!     TaskCallbacks::new().on_completion(|result| {
//!         // exactly one terminal outcome per task
//!     }),
//! );
//! ```
//!
//! # Key behaviors
//!
//! - **Coalescing**: equivalent concurrent requests share one session; each
//!   caller keeps its own callbacks, progress, and priority.
//! - **Priority**: a session always runs at the maximum priority across its
//!   subscribers, re-sorting queued work when that maximum changes.
//! - **Cancellation**: cancelling the last subscriber tears down the whole
//!   chain; cancelling any other subscriber does nothing to shared work.
//! - **Resumable downloads**: bytes from interrupted fetches are saved and
//!   the next request for the same resource continues where they stopped
//!   (when the server confirms with 206).
//! - **Progressive delivery**: optionally, partially decoded images are
//!   delivered before the final image.

pub mod cache;
pub mod cancellation;
pub mod config;
pub mod decode;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod pipeline;
pub mod process;
pub mod rate_limiter;
pub mod request;
pub mod resumable;
pub mod task;

mod queue;
mod session;

pub use cache::{ImageCache, MemoryImageCache};
pub use cancellation::{CancellationSource, CancellationToken};
pub use config::{PipelineConfig, PipelineServices};
pub use decode::{DecodeContext, DecodedImage, DecoderSelector, ImageDecoder, StandardDecoder};
pub use error::ImageLoadError;
pub use loader::{DataChunk, DataLoader, LoadError, LoadRequest, ResponseInfo};
pub use metrics::{MetricsSnapshot, PipelineMetrics, SessionMetrics, TaskMetrics};
pub use pipeline::ImagePipeline;
pub use process::{ImageProcessor, ProcessingContext, ProcessorSelector};
pub use rate_limiter::RateLimit;
pub use request::{CachePolicy, ImageRequest, Priority, SessionKey};
pub use resumable::{ResumableData, ResumableDataCache, Validator};
pub use task::{ImageResponse, ImageTask, TaskCallbacks, TaskId};
