//! Data-loader capability boundary.
//!
//! The pipeline never talks to a transport directly; it consumes a
//! [`DataLoader`] that turns a [`LoadRequest`] into a stream of
//! [`DataChunk`]s. Stream end means completion; an `Err` item is the
//! transport failure, surfaced to subscribers verbatim. Retry and backoff
//! policy belong to the loader implementation, not to this crate.
//!
//! Loaders must honor `Range` and `If-Range` headers when present — that is
//! what makes resumed downloads possible (see [`crate::resumable`]).

use bytes::Bytes;
use futures::stream::BoxStream;

/// A transport-level request produced by the pipeline.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Resource locator from the originating [`crate::ImageRequest`].
    pub url: String,
    /// Extra headers, currently the `Range`/`If-Range` pair attached when a
    /// resumable entry is being consumed.
    pub headers: Vec<(String, String)>,
}

impl LoadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }
}

/// Response metadata observed alongside each delivered chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    /// HTTP-like status code; 206 confirms a honored range request.
    pub status_code: u16,
    /// Declared remaining content length, if the transport knows it.
    pub content_length: Option<u64>,
    /// Entity tag, used as a resume validator.
    pub etag: Option<String>,
    /// Last-Modified value, the fallback resume validator.
    pub last_modified: Option<String>,
    /// `Accept-Ranges` value; resumption requires `bytes`.
    pub accept_ranges: Option<String>,
}

impl ResponseInfo {
    /// A plain 200 response with a known length and no validators.
    pub fn ok(content_length: Option<u64>) -> Self {
        Self {
            status_code: 200,
            content_length,
            etag: None,
            last_modified: None,
            accept_ranges: None,
        }
    }

    /// True when the server honored a range request.
    pub fn is_partial_content(&self) -> bool {
        self.status_code == 206
    }

    /// True when the server advertises byte-range support.
    pub fn supports_byte_ranges(&self) -> bool {
        self.accept_ranges
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"))
    }
}

/// One incremental delivery from the transport.
#[derive(Debug, Clone)]
pub struct DataChunk {
    pub bytes: Bytes,
    pub response: ResponseInfo,
}

/// A transport failure, surfaced verbatim to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub message: String,
    pub status_code: Option<u16>,
}

impl LoadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status_code: u16) -> Self {
        Self {
            message: message.into(),
            status_code: Some(status_code),
        }
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (status {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for LoadError {}

/// The byte-fetching capability consumed by the pipeline.
///
/// Implementations deliver zero or more `Ok(DataChunk)` items followed by
/// stream end (success) or a single `Err` item (failure; the stream is not
/// polled afterwards). The pipeline cancels a load by dropping the stream.
pub trait DataLoader: Send + Sync + 'static {
    fn load(&self, request: LoadRequest) -> BoxStream<'static, Result<DataChunk, LoadError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_partial_content() {
        let mut response = ResponseInfo::ok(Some(100));
        assert!(!response.is_partial_content());

        response.status_code = 206;
        assert!(response.is_partial_content());
    }

    #[test]
    fn test_response_byte_range_support() {
        let mut response = ResponseInfo::ok(None);
        assert!(!response.supports_byte_ranges());

        response.accept_ranges = Some("none".to_string());
        assert!(!response.supports_byte_ranges());

        response.accept_ranges = Some("Bytes".to_string());
        assert!(response.supports_byte_ranges());
    }

    #[test]
    fn test_load_error_display() {
        let plain = LoadError::new("connection reset");
        assert_eq!(format!("{plain}"), "connection reset");

        let with_status = LoadError::with_status("not found", 404);
        assert_eq!(format!("{with_status}"), "not found (status 404)");
    }
}
