//! Error taxonomy for terminal task outcomes.

use crate::loader::LoadError;
use thiserror::Error;

/// The failure delivered to subscribers when a session cannot produce an
/// image.
///
/// Cancellation is deliberately absent: a cancelled task receives neither a
/// success nor a failure callback, it is simply dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageLoadError {
    /// The decoder returned no image on the final attempt.
    ///
    /// Also reported when a fetch completes with zero bytes and no
    /// transport error. That conflates an empty resource with a
    /// misbehaving loader; the two are indistinguishable at this layer.
    #[error("image decoding failed")]
    DecodingFailed,

    /// The processor returned no image.
    #[error("image processing failed")]
    ProcessingFailed,

    /// The data loader failed; the underlying error is surfaced verbatim.
    /// Retry policy, if any, belongs to the loader.
    #[error("data loading failed: {0}")]
    LoadFailed(#[from] LoadError),
}
