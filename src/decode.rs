//! Decoder capability boundary and the default `image`-backed decoder.
//!
//! A decoder is selected once per session — from the request, the response
//! metadata, and the first received chunk — and retained for the session's
//! lifetime. Partial decode attempts return `None` to mean "not enough data
//! yet"; only a `None` on the final attempt is a decode failure.

use crate::loader::ResponseInfo;
use crate::request::ImageRequest;
use bytes::Bytes;
use std::sync::Arc;

/// A decoded bitmap, cheap to clone and deliver to many subscribers.
#[derive(Clone)]
pub struct DecodedImage {
    image: Arc<image::DynamicImage>,
    is_preview: bool,
}

impl DecodedImage {
    /// Wraps a final decoded bitmap.
    pub fn new(image: Arc<image::DynamicImage>) -> Self {
        Self {
            image,
            is_preview: false,
        }
    }

    /// Wraps a partially decoded (progressive) bitmap.
    pub fn preview(image: Arc<image::DynamicImage>) -> Self {
        Self {
            image,
            is_preview: true,
        }
    }

    pub fn image(&self) -> &Arc<image::DynamicImage> {
        &self.image
    }

    /// True for progressive partials delivered before the final image.
    pub fn is_preview(&self) -> bool {
        self.is_preview
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Estimated memory footprint, used for result-cache cost accounting.
    pub fn byte_cost(&self) -> usize {
        (self.width() as usize) * (self.height() as usize) * 4
    }
}

impl std::fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("is_preview", &self.is_preview)
            .finish()
    }
}

/// Inputs available when selecting a decoder for a session.
#[derive(Clone)]
pub struct DecodeContext {
    pub request: ImageRequest,
    pub response: ResponseInfo,
    /// The bytes received so far (at selection time, the first chunk).
    pub data: Bytes,
}

/// The decode capability consumed by the pipeline.
///
/// `decode` is CPU-bound and is always invoked off the pipeline's
/// bookkeeping context (on the blocking pool).
pub trait ImageDecoder: Send + Sync + 'static {
    /// Decodes the buffer accumulated so far.
    ///
    /// With `is_final == false` this is a progressive attempt and `None`
    /// means the buffer is not yet decodable — not an error. With
    /// `is_final == true`, `None` is a decode failure.
    fn decode(&self, data: &[u8], is_final: bool) -> Option<DecodedImage>;
}

/// Chooses a decoder per session from the decode context.
pub type DecoderSelector = Arc<dyn Fn(&DecodeContext) -> Arc<dyn ImageDecoder> + Send + Sync>;

/// Default decoder backed by the `image` crate's format sniffing.
///
/// Progressive attempts simply try a full decode of the buffer so far:
/// formats whose trailing metadata is required will keep returning `None`
/// until enough bytes arrive, which is exactly the contract.
pub struct StandardDecoder;

impl ImageDecoder for StandardDecoder {
    fn decode(&self, data: &[u8], is_final: bool) -> Option<DecodedImage> {
        match image::load_from_memory(data) {
            Ok(decoded) => {
                let image = Arc::new(decoded);
                if is_final {
                    Some(DecodedImage::new(image))
                } else {
                    Some(DecodedImage::preview(image))
                }
            }
            Err(_) => None,
        }
    }
}

/// The default selector: every session gets the [`StandardDecoder`].
pub fn standard_decoder_selector() -> DecoderSelector {
    let decoder: Arc<dyn ImageDecoder> = Arc::new(StandardDecoder);
    Arc::new(move |_ctx: &DecodeContext| Arc::clone(&decoder))
}
