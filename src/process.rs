//! Processor capability boundary.
//!
//! Processors transform a decoded bitmap after decode: resizing, rounding
//! corners, tone mapping — whatever the embedding application plugs in. The
//! pipeline only knows the seam: an identity (folded into cache keys) and a
//! fallible transform. Progressive partials pass through the same seam with
//! a non-final context.

use crate::decode::DecodedImage;
use crate::request::ImageRequest;
use std::sync::Arc;

/// Inputs available to a processor invocation.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub request: ImageRequest,
    /// False for progressive partials, true for the final image.
    pub is_final: bool,
}

/// The transform capability consumed by the pipeline.
///
/// `process` is CPU-bound and is always invoked off the pipeline's
/// bookkeeping context (on the blocking pool). Returning `None` from a
/// final invocation is a processing failure; from a partial invocation it
/// just skips that partial.
pub trait ImageProcessor: Send + Sync + 'static {
    /// Stable identity, folded into result-cache and coalescing keys.
    fn id(&self) -> &str;

    fn process(&self, image: DecodedImage, ctx: &ProcessingContext) -> Option<DecodedImage>;
}

/// Chooses the processor for a session's decoded output, if any.
///
/// Called separately for partial (`is_final == false`) and final
/// (`is_final == true`) invocations.
pub type ProcessorSelector =
    Arc<dyn Fn(&ImageRequest, bool) -> Option<Arc<dyn ImageProcessor>> + Send + Sync>;

/// Default selector: use whatever processor the request itself carries.
pub fn request_processor_selector() -> ProcessorSelector {
    Arc::new(|request: &ImageRequest, _is_final: bool| request.processor.clone())
}
