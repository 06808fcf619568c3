//! Shared test doubles for the integration suites.
#![allow(dead_code)]

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use pixelpipe::{
    DataChunk, DataLoader, DecodeContext, DecodedImage, DecoderSelector, ImageDecoder,
    ImageProcessor, LoadError, LoadRequest, ProcessingContext, ResponseInfo,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One step of a scripted load attempt.
pub enum Step {
    /// Deliver bytes with response metadata.
    Chunk(Vec<u8>, ResponseInfo),
    /// Pause before the next step.
    Delay(Duration),
    /// Fail the attempt.
    Fail(LoadError),
}

/// A loader that replays per-URL scripts, one per attempt, recording every
/// request it receives.
#[derive(Default)]
pub struct ScriptedLoader {
    scripts: Mutex<HashMap<String, VecDeque<Vec<Step>>>>,
    requests: Mutex<Vec<LoadRequest>>,
    load_count: AtomicUsize,
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a script for the next attempt against `url`.
    pub fn script(&self, url: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(steps);
    }

    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<LoadRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// URLs of received requests, in order.
    pub fn requested_urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }
}

impl DataLoader for ScriptedLoader {
    fn load(&self, request: LoadRequest) -> BoxStream<'static, Result<DataChunk, LoadError>> {
        self.load_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let steps: VecDeque<Step> = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(|attempts| attempts.pop_front())
            .unwrap_or_default()
            .into();

        futures::stream::unfold(steps, |mut steps| async move {
            while let Some(step) = steps.pop_front() {
                match step {
                    Step::Delay(duration) => tokio::time::sleep(duration).await,
                    Step::Chunk(bytes, response) => {
                        return Some((
                            Ok(DataChunk {
                                bytes: Bytes::from(bytes),
                                response,
                            }),
                            steps,
                        ))
                    }
                    Step::Fail(error) => return Some((Err(error), steps)),
                }
            }
            None
        })
        .boxed()
    }
}

/// A decoder that reports the decoded byte count as the image width, so
/// tests can assert exactly which buffer a result came from.
#[derive(Default)]
pub struct TestDecoder {
    pub final_decodes: AtomicUsize,
    pub partial_decodes: AtomicUsize,
    /// When set, the final decode returns no image.
    pub fail_final: AtomicBool,
}

impl TestDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_final() -> Self {
        let decoder = Self::default();
        decoder.fail_final.store(true, Ordering::SeqCst);
        decoder
    }
}

impl ImageDecoder for TestDecoder {
    fn decode(&self, data: &[u8], is_final: bool) -> Option<DecodedImage> {
        if is_final {
            self.final_decodes.fetch_add(1, Ordering::SeqCst);
            if data.is_empty() || self.fail_final.load(Ordering::SeqCst) {
                return None;
            }
            Some(DecodedImage::new(Arc::new(image::DynamicImage::new_rgba8(
                data.len() as u32,
                1,
            ))))
        } else {
            self.partial_decodes.fetch_add(1, Ordering::SeqCst);
            if data.is_empty() {
                return None;
            }
            Some(DecodedImage::preview(Arc::new(
                image::DynamicImage::new_rgba8(data.len() as u32, 1),
            )))
        }
    }
}

/// Selector pinning every session to one decoder instance.
pub fn fixed_decoder_selector(decoder: Arc<TestDecoder>) -> DecoderSelector {
    Arc::new(move |_ctx: &DecodeContext| Arc::clone(&decoder) as Arc<dyn ImageDecoder>)
}

/// A processor that bumps the image height by one so results are
/// distinguishable from unprocessed ones, or fails on demand.
pub struct TestProcessor {
    id: String,
    pub invocations: AtomicUsize,
    pub fail: AtomicBool,
}

impl TestProcessor {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            invocations: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn failing(id: &str) -> Self {
        let processor = Self::new(id);
        processor.fail.store(true, Ordering::SeqCst);
        processor
    }
}

impl ImageProcessor for TestProcessor {
    fn id(&self) -> &str {
        &self.id
    }

    fn process(&self, image: DecodedImage, ctx: &ProcessingContext) -> Option<DecodedImage> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return None;
        }
        let bumped = Arc::new(image::DynamicImage::new_rgba8(
            image.width(),
            image.height() + 1,
        ));
        Some(if ctx.is_final {
            DecodedImage::new(bumped)
        } else {
            DecodedImage::preview(bumped)
        })
    }
}

/// A 200 response with a declared length and no resume support.
pub fn ok_response(content_length: u64) -> ResponseInfo {
    ResponseInfo::ok(Some(content_length))
}

/// A 200 response that supports resumption (strong ETag + byte ranges).
pub fn resumable_response(content_length: u64) -> ResponseInfo {
    ResponseInfo {
        status_code: 200,
        content_length: Some(content_length),
        etag: Some("\"v1\"".to_string()),
        last_modified: None,
        accept_ranges: Some("bytes".to_string()),
    }
}

/// A 206 response confirming a honored range request; `remaining` is the
/// length left after the resumed offset.
pub fn partial_response(remaining: u64) -> ResponseInfo {
    ResponseInfo {
        status_code: 206,
        content_length: Some(remaining),
        etag: Some("\"v1\"".to_string()),
        last_modified: None,
        accept_ranges: Some("bytes".to_string()),
    }
}

/// Polls `cond` until it holds or `deadline_ms` elapses.
pub async fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
