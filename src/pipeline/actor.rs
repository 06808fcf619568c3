//! The bookkeeping actor: single owner of all session-registry state.
//!
//! Every registry read and write — submissions, cancellations, priority
//! updates, fetch events, decode and process results — arrives here as a
//! [`PipelineMsg`] and is handled on one task, making the session state
//! machine race-free without fine-grained locking. Handlers never await:
//! anything slow (fetching, decoding, processing, caller callbacks) runs
//! elsewhere and reports back by message.

use super::PipelineMsg;
use crate::cancellation::CancellationSource;
use crate::config::{PipelineConfig, PipelineServices};
use crate::decode::{DecodeContext, DecodedImage};
use crate::error::ImageLoadError;
use crate::loader::{LoadError, LoadRequest, ResponseInfo};
use crate::metrics::{PipelineMetrics, TaskMetrics};
use crate::process::ProcessingContext;
use crate::queue::WorkQueue;
use crate::rate_limiter::RateLimiter;
use crate::request::{ImageRequest, Priority, SessionKey};
use crate::resumable::{ResumableData, ResumableDataCache};
use crate::session::{Session, SessionId, Subscriber};
use crate::task::{CompletionHandler, ImageResponse, TaskCallbacks, TaskId, TaskProgress};
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken as RawToken;
use tracing::{debug, warn};

/// A callback invocation queued for the delivery task.
type DeliveryJob = Box<dyn FnOnce() + Send>;

/// All mutable pipeline state, confined to the actor task.
pub(crate) struct PipelineState {
    config: PipelineConfig,
    services: PipelineServices,
    metrics: Arc<PipelineMetrics>,
    /// Sender for self-addressed messages from spawned stage work.
    tx: mpsc::UnboundedSender<PipelineMsg>,
    /// Callbacks run here, in submission order, off the actor.
    delivery_tx: mpsc::UnboundedSender<DeliveryJob>,

    /// The session registry: sole strong owner of every session.
    sessions: HashMap<SessionKey, Session>,
    session_keys: HashMap<SessionId, SessionKey>,
    task_index: HashMap<TaskId, SessionId>,

    fetch_queue: WorkQueue,
    processing_queue: WorkQueue,
    rate_limiter: RateLimiter,
    resumable_cache: Arc<ResumableDataCache>,
}

impl PipelineState {
    pub(crate) fn new(
        services: PipelineServices,
        config: PipelineConfig,
        metrics: Arc<PipelineMetrics>,
        tx: mpsc::UnboundedSender<PipelineMsg>,
    ) -> Self {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel::<DeliveryJob>();
        tokio::spawn(delivery_loop(delivery_rx));

        let fetch_queue = WorkQueue::new("fetch", config.fetch_concurrency);
        let processing_queue = WorkQueue::new("processing", config.processing_concurrency);
        let rate_limiter = RateLimiter::new(config.rate_limiter_enabled, config.rate_limit.clone());
        let resumable_cache = Arc::new(ResumableDataCache::new(
            config.resumable_cache_bytes,
            config.resumable_cache_entries,
        ));

        Self {
            config,
            services,
            metrics,
            tx,
            delivery_tx,
            sessions: HashMap::new(),
            session_keys: HashMap::new(),
            task_index: HashMap::new(),
            fetch_queue,
            processing_queue,
            rate_limiter,
            resumable_cache,
        }
    }

    fn handle(&mut self, msg: PipelineMsg) {
        match msg {
            PipelineMsg::Submit {
                task_id,
                request,
                callbacks,
                progress,
                metrics,
                cancelled,
            } => self.handle_submit(task_id, request, callbacks, progress, metrics, cancelled),
            PipelineMsg::Cancel { task_id } => self.handle_cancel(task_id),
            PipelineMsg::UpdatePriority { task_id, priority } => {
                self.handle_update_priority(task_id, priority)
            }
            PipelineMsg::StartFetch { session_id } => self.handle_start_fetch(session_id),
            PipelineMsg::FetchData {
                session_id,
                chunk,
                response,
            } => self.handle_fetch_data(session_id, chunk, response),
            PipelineMsg::FetchCompleted { session_id, error } => {
                self.handle_fetch_completed(session_id, error)
            }
            PipelineMsg::PartialDecoded { session_id, image } => {
                self.handle_partial_decoded(session_id, image)
            }
            PipelineMsg::PartialProcessed { session_id, image } => {
                self.handle_partial_processed(session_id, image)
            }
            PipelineMsg::FinalDecoded { session_id, image } => {
                self.handle_final_decoded(session_id, image)
            }
            PipelineMsg::FinalProcessed { session_id, image } => {
                self.handle_final_processed(session_id, image)
            }
        }
    }

    // === Task intake ===

    fn handle_submit(
        &mut self,
        task_id: TaskId,
        request: ImageRequest,
        callbacks: TaskCallbacks,
        progress: Arc<TaskProgress>,
        metrics: Arc<TaskMetrics>,
        cancelled: Arc<AtomicBool>,
    ) {
        // Preflight: cancelled between submit() and admission.
        if cancelled.load(Ordering::SeqCst) {
            debug!(task = %task_id, "task cancelled before admission");
            return;
        }

        // Probe the result cache; a hit never creates a session.
        if request.cache_policy.read_allowed {
            if let Some(image) = self.services.image_cache.get(&request.cache_key()) {
                debug!(task = %task_id, url = %request.url, "result cache hit");
                self.metrics.record_cache_hit();
                self.metrics.record_task_completed();
                metrics.mark_cache_hit();
                metrics.mark_completed();
                if let Some(handler) = callbacks.on_completion {
                    self.deliver(move || {
                        handler(Ok(ImageResponse {
                            image,
                            cache_hit: true,
                        }))
                    });
                }
                return;
            }
            self.metrics.record_cache_miss();
        }

        let key = SessionKey::for_request(&request, self.config.deduplication_enabled);
        let subscriber = Subscriber {
            priority: request.priority,
            progress,
            metrics: Arc::clone(&metrics),
            on_completion: callbacks.on_completion,
            on_progress: callbacks.on_progress,
            on_partial_image: callbacks.on_partial_image,
        };

        if let Some(session) = self.sessions.get_mut(&key) {
            // Coalesce onto the in-flight session.
            metrics.mark_deduplicated();
            self.metrics.record_task_coalesced();
            let (completed, total) = session.progress_units();
            subscriber.progress.set(completed, total);
            session.attach(task_id, subscriber);
            self.task_index.insert(task_id, session.id);
            debug!(
                task = %task_id,
                session = %session.id,
                subscribers = session.subscribers.len(),
                "task attached to existing session"
            );
            return;
        }

        let mut session = Session::new(key.clone(), request);
        let session_id = session.id;
        session.attach(task_id, subscriber);

        self.task_index.insert(task_id, session_id);
        self.session_keys.insert(session_id, key.clone());
        let token = session.token();
        let url = session.request.url.clone();
        self.sessions.insert(key, session);
        self.metrics.record_session_created();
        debug!(task = %task_id, session = %session_id, url = %url, "session created");

        // New work is admitted through the rate limiter; a cancelled
        // session's admission is dropped before it starts anything.
        let tx = self.tx.clone();
        self.rate_limiter.execute(
            token,
            Box::new(move || {
                let _ = tx.send(PipelineMsg::StartFetch { session_id });
            }),
        );
    }

    fn handle_cancel(&mut self, task_id: TaskId) {
        let Some(session_id) = self.task_index.remove(&task_id) else {
            // Never admitted, already finished, or served from cache.
            debug!(task = %task_id, "cancel for task with no session");
            return;
        };
        self.metrics.record_task_cancelled();

        let Some(key) = self.session_keys.get(&session_id).cloned() else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&key) else {
            return;
        };

        session.detach(task_id);

        if !session.is_empty() {
            debug!(
                task = %task_id,
                session = %session_id,
                remaining = session.subscribers.len(),
                "subscriber cancelled; session continues"
            );
            return;
        }

        debug!(task = %task_id, session = %session_id, "last subscriber cancelled; tearing down session");

        // Save partial bytes before tearing anything down, then cancel the
        // source so every queued or running unit of work unwinds.
        self.save_resumable(&key);
        if let Some(mut session) = self.remove_session(&key) {
            if let Some(partial) = session.partial_processing.take() {
                partial.cancel();
            }
            session.source.cancel();
        }
    }

    fn handle_update_priority(&mut self, task_id: TaskId, priority: Priority) {
        let Some(session_id) = self.task_index.get(&task_id).copied() else {
            return;
        };
        let Some(key) = self.session_keys.get(&session_id) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };

        if let Some(subscriber) = session.subscribers.get_mut(&task_id) {
            subscriber.priority = priority;
        }
        session.sync_priority();
        debug!(
            task = %task_id,
            session = %session_id,
            effective = ?session.priority.get(),
            "priority updated"
        );
    }

    // === Fetch orchestration ===

    fn handle_start_fetch(&mut self, session_id: SessionId) {
        let Some(key) = self.session_keys.get(&session_id) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        if session.source.is_cancelling() {
            return;
        }

        let mut load_request = LoadRequest::new(session.request.url.clone());
        if self.config.resumable_data_enabled {
            if let Some(entry) = self.resumable_cache.take(&session.request.url) {
                debug!(
                    session = %session_id,
                    offset = entry.data.len(),
                    "attaching resumable data to fetch"
                );
                load_request.headers = entry.request_headers();
                session.resumable = Some(entry);
            }
        }

        session.metrics.mark_fetch_started();
        self.metrics.record_fetch_started();

        let loader = Arc::clone(&self.services.loader);
        let token = session.token();
        let tx = self.tx.clone();
        let work = async move {
            let mut stream = loader.load(load_request);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        // Dropping the stream cancels the transport; the
                        // worker slot frees regardless of how this raced
                        // natural completion.
                        break;
                    }
                    item = stream.next() => match item {
                        Some(Ok(chunk)) => {
                            if tx
                                .send(PipelineMsg::FetchData {
                                    session_id,
                                    chunk: chunk.bytes,
                                    response: chunk.response,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Some(Err(error)) => {
                            let _ = tx.send(PipelineMsg::FetchCompleted {
                                session_id,
                                error: Some(error),
                            });
                            break;
                        }
                        None => {
                            let _ = tx.send(PipelineMsg::FetchCompleted {
                                session_id,
                                error: None,
                            });
                            break;
                        }
                    }
                }
            }
        }
        .boxed();

        self.fetch_queue
            .submit(session.priority.clone(), session.token(), work);
    }

    fn handle_fetch_data(&mut self, session_id: SessionId, chunk: Bytes, response: ResponseInfo) {
        let Some(key) = self.session_keys.get(&session_id) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        if session.completed {
            return;
        }

        // The first response decides whether the server honored resumption.
        if session.last_response.is_none() {
            if let Some(entry) = session.resumable.take() {
                if entry.is_confirmed_by(&response) {
                    session.resumed_bytes = entry.data.len() as u64;
                    session.buffer.extend_from_slice(&entry.data);
                    session.metrics.mark_resumed();
                    self.metrics.record_resumable_resume();
                    debug!(
                        session = %session_id,
                        resumed_bytes = session.resumed_bytes,
                        "server confirmed resume; buffer seeded"
                    );
                } else {
                    self.metrics.record_resumable_rejected();
                    debug!(
                        session = %session_id,
                        status = response.status_code,
                        "server rejected resume; starting from zero"
                    );
                }
            }
        }

        session.last_response = Some(response);
        session.buffer.extend_from_slice(&chunk);
        session.metrics.add_bytes(chunk.len() as u64);
        self.metrics.record_bytes_downloaded(chunk.len() as u64);

        // Select the decoder once, from the first bytes, and retain it.
        if session.decoder.is_none() {
            let ctx = DecodeContext {
                request: session.request.clone(),
                response: session.last_response.clone().expect("response just set"),
                data: Bytes::copy_from_slice(&session.buffer),
            };
            session.decoder = Some((self.services.decoder_selector)(&ctx));
        }

        // Progress fan-out against a snapshot of the current subscribers.
        let (completed, total) = session.progress_units();
        let mut handlers = Vec::new();
        for subscriber in session.subscribers.values() {
            subscriber.progress.set(completed, total);
            if let Some(handler) = &subscriber.on_progress {
                handlers.push(Arc::clone(handler));
            }
        }
        if !handlers.is_empty() {
            let _ = self.delivery_tx.send(Box::new(move || {
                for handler in handlers {
                    handler(completed, total);
                }
            }));
        }

        // Progressive decode of the buffer so far: only while the declared
        // total is known and not yet reached, and never more than one
        // attempt in flight per session.
        if self.config.progressive_decoding_enabled
            && total > 0
            && completed < total
            && !session.partial_decode_in_flight
        {
            let decoder = Arc::clone(session.decoder.as_ref().expect("decoder selected above"));
            session.partial_decode_in_flight = true;
            let snapshot = Bytes::copy_from_slice(&session.buffer);
            let token = session.token();
            let tx = self.tx.clone();
            tokio::task::spawn_blocking(move || {
                let image = if token.is_cancelling() {
                    None
                } else {
                    decoder.decode(&snapshot, false)
                };
                let _ = tx.send(PipelineMsg::PartialDecoded { session_id, image });
            });
        }
    }

    fn handle_fetch_completed(&mut self, session_id: SessionId, error: Option<LoadError>) {
        let Some(key) = self.session_keys.get(&session_id).cloned() else {
            return;
        };
        {
            let Some(session) = self.sessions.get_mut(&key) else {
                return;
            };
            if session.completed {
                return;
            }
            session.metrics.mark_fetch_finished();
        }

        if let Some(error) = error {
            warn!(session = %session_id, error = %error, "fetch failed");
            // Best-effort save of what arrived before failing the session.
            self.save_resumable(&key);
            self.fail_session(&key, ImageLoadError::LoadFailed(error));
            return;
        }

        let session = self.sessions.get_mut(&key).expect("session checked above");
        if session.buffer.is_empty() {
            // Zero bytes with no transport error reads as undecodable
            // content, not a transport failure.
            self.fail_session(&key, ImageLoadError::DecodingFailed);
            return;
        }

        let Some(decoder) = session.decoder.clone() else {
            // Bytes without a decoder cannot happen (selection rides the
            // first data event), but a missing decoder is a decode failure.
            self.fail_session(&key, ImageLoadError::DecodingFailed);
            return;
        };

        // The buffer is no longer needed after the final decode; move it
        // out instead of copying.
        let data = std::mem::take(&mut session.buffer);
        let token = session.token();
        let tx = self.tx.clone();
        tokio::task::spawn_blocking(move || {
            let image = if token.is_cancelling() {
                None
            } else {
                decoder.decode(&data, true)
            };
            let _ = tx.send(PipelineMsg::FinalDecoded { session_id, image });
        });
    }

    // === Decode and processing results ===

    fn handle_partial_decoded(&mut self, session_id: SessionId, image: Option<DecodedImage>) {
        let Some(key) = self.session_keys.get(&session_id) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        session.partial_decode_in_flight = false;

        if session.completed {
            return;
        }
        // `None` from a partial attempt just means not enough data yet.
        let Some(image) = image else {
            return;
        };

        match (self.services.processor_selector)(&session.request, false) {
            None => {
                deliver_partial(session, &self.metrics, &self.delivery_tx, image);
            }
            Some(processor) => {
                if session.partial_processing.is_some() {
                    // One partial-processing unit at a time; newer partials
                    // are skipped, not queued.
                    debug!(session = %session_id, "partial image dropped; processing busy");
                    return;
                }

                let partial_source = CancellationSource::new();
                let ptoken = partial_source.token();
                session.partial_processing = Some(partial_source);

                let ctx = ProcessingContext {
                    request: session.request.clone(),
                    is_final: false,
                };
                let tx = self.tx.clone();
                let queue_token = ptoken.clone();
                let work = async move {
                    let image = if ptoken.is_cancelling() {
                        None
                    } else {
                        tokio::task::spawn_blocking(move || processor.process(image, &ctx))
                            .await
                            .ok()
                            .flatten()
                    };
                    let _ = tx.send(PipelineMsg::PartialProcessed { session_id, image });
                }
                .boxed();
                self.processing_queue
                    .submit(session.priority.clone(), queue_token, work);
            }
        }
    }

    fn handle_partial_processed(&mut self, session_id: SessionId, image: Option<DecodedImage>) {
        let Some(key) = self.session_keys.get(&session_id) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        session.partial_processing = None;

        if session.completed {
            return;
        }
        if let Some(image) = image {
            deliver_partial(session, &self.metrics, &self.delivery_tx, image);
        }
    }

    fn handle_final_decoded(&mut self, session_id: SessionId, image: Option<DecodedImage>) {
        let Some(key) = self.session_keys.get(&session_id).cloned() else {
            return;
        };
        {
            let Some(session) = self.sessions.get_mut(&key) else {
                return;
            };
            if session.completed {
                return;
            }
            session.metrics.mark_decode_finished();
        }

        let Some(image) = image else {
            self.fail_session(&key, ImageLoadError::DecodingFailed);
            return;
        };

        let session = self.sessions.get_mut(&key).expect("session checked above");
        match (self.services.processor_selector)(&session.request, true) {
            None => self.finalize_success(&key, image),
            Some(processor) => {
                let ctx = ProcessingContext {
                    request: session.request.clone(),
                    is_final: true,
                };
                let token = session.token();
                let tx = self.tx.clone();
                let queue_token = token.clone();
                let work = async move {
                    let image = if token.is_cancelling() {
                        None
                    } else {
                        tokio::task::spawn_blocking(move || processor.process(image, &ctx))
                            .await
                            .ok()
                            .flatten()
                    };
                    let _ = tx.send(PipelineMsg::FinalProcessed { session_id, image });
                }
                .boxed();
                self.processing_queue
                    .submit(session.priority.clone(), queue_token, work);
            }
        }
    }

    fn handle_final_processed(&mut self, session_id: SessionId, image: Option<DecodedImage>) {
        let Some(key) = self.session_keys.get(&session_id).cloned() else {
            return;
        };
        {
            let Some(session) = self.sessions.get_mut(&key) else {
                return;
            };
            if session.completed {
                return;
            }
            session.metrics.mark_process_finished();
        }

        match image {
            Some(image) => self.finalize_success(&key, image),
            None => self.fail_session(&key, ImageLoadError::ProcessingFailed),
        }
    }

    // === Finalization and teardown ===

    /// Removes a session from the registry, exactly once, cleaning every
    /// index that points at it.
    fn remove_session(&mut self, key: &SessionKey) -> Option<Session> {
        let session = self.sessions.remove(key)?;
        self.session_keys.remove(&session.id);
        for task_id in session.subscribers.keys() {
            self.task_index.remove(task_id);
        }
        self.metrics.record_session_torn_down();
        debug!(session = %session.id, key = ?session.key, "session removed from registry");
        Some(session)
    }

    fn finalize_success(&mut self, key: &SessionKey, image: DecodedImage) {
        let Some(mut session) = self.remove_session(key) else {
            return;
        };
        session.completed = true;

        // A still-running partial is moot now.
        if let Some(partial) = session.partial_processing.take() {
            partial.cancel();
        }

        if session.request.cache_policy.write_allowed {
            self.services
                .image_cache
                .set(session.request.cache_key(), image.clone());
        }

        let mut handlers: Vec<CompletionHandler> = Vec::new();
        for (_, subscriber) in session.subscribers.drain() {
            subscriber.metrics.mark_completed();
            self.metrics.record_task_completed();
            if let Some(handler) = subscriber.on_completion {
                handlers.push(handler);
            }
        }

        debug!(
            session = %session.id,
            url = %session.request.url,
            subscribers = handlers.len(),
            "session finalized"
        );

        let response = ImageResponse {
            image,
            cache_hit: false,
        };
        self.deliver(move || {
            for handler in handlers {
                handler(Ok(response.clone()));
            }
        });
    }

    fn fail_session(&mut self, key: &SessionKey, error: ImageLoadError) {
        let Some(mut session) = self.remove_session(key) else {
            return;
        };
        session.completed = true;

        if let Some(partial) = session.partial_processing.take() {
            partial.cancel();
        }
        session.source.cancel();

        let mut handlers: Vec<CompletionHandler> = Vec::new();
        for (_, subscriber) in session.subscribers.drain() {
            subscriber.metrics.mark_completed();
            self.metrics.record_task_failed();
            if let Some(handler) = subscriber.on_completion {
                handlers.push(handler);
            }
        }

        warn!(
            session = %session.id,
            url = %session.request.url,
            error = %error,
            "session failed"
        );

        self.deliver(move || {
            for handler in handlers {
                handler(Err(error.clone()));
            }
        });
    }

    /// Best-effort save of the session's accumulated bytes for a later
    /// resume attempt. Requires a validator and byte-range support; silent
    /// otherwise.
    fn save_resumable(&mut self, key: &SessionKey) {
        if !self.config.resumable_data_enabled {
            return;
        }
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        if session.buffer.is_empty() {
            return;
        }
        let Some(response) = session.last_response.clone() else {
            return;
        };

        let total = session.total_expected();
        let data = Bytes::from(std::mem::take(&mut session.buffer));
        let byte_count = data.len();
        if let Some(entry) = ResumableData::new(data, &response, total) {
            self.resumable_cache
                .store(session.request.url.clone(), entry);
            self.metrics.record_resumable_save();
            debug!(
                session = %session.id,
                bytes = byte_count,
                "saved resumable data"
            );
        }
    }

    /// Queues a callback invocation on the delivery task.
    fn deliver(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.delivery_tx.send(Box::new(job));
    }
}

/// Delivers a partial image to a snapshot of the session's subscribers.
fn deliver_partial(
    session: &Session,
    metrics: &PipelineMetrics,
    delivery_tx: &mpsc::UnboundedSender<DeliveryJob>,
    image: DecodedImage,
) {
    // Re-checked here: a session that completed while the partial was being
    // produced must not emit it after the final result.
    if session.completed {
        return;
    }

    let handlers: Vec<_> = session
        .subscribers
        .values()
        .filter_map(|s| s.on_partial_image.clone())
        .collect();
    if handlers.is_empty() {
        return;
    }

    metrics.record_partial_image_delivered();
    let _ = delivery_tx.send(Box::new(move || {
        for handler in handlers {
            handler(image.clone());
        }
    }));
}

/// Runs queued callback jobs in order, off the bookkeeping actor.
async fn delivery_loop(mut rx: mpsc::UnboundedReceiver<DeliveryJob>) {
    while let Some(job) = rx.recv().await {
        job();
    }
}

/// The actor loop: owns the state until shutdown or channel close.
pub(crate) async fn run(
    mut state: PipelineState,
    mut rx: mpsc::UnboundedReceiver<PipelineMsg>,
    shutdown: RawToken,
) {
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => state.handle(msg),
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("pipeline actor stopped");
}
