//! The image-loading pipeline orchestrator.
//!
//! [`ImagePipeline`] turns N independent load requests into at most one
//! underlying fetch → decode → process chain per unique resource, fans the
//! result back out to every subscriber, and tears sessions down in a
//! well-defined order when they complete, fail, or lose their last
//! subscriber.
//!
//! # Architecture
//!
//! ```text
//! submit() ──► result cache ──[hit]──► completion callback
//!                  │
//!                [miss]
//!                  ▼
//!            session registry ──[existing key]──► attach subscriber
//!                  │
//!              [new key]
//!                  ▼
//!             RateLimiter ──► fetch queue ──► DataLoader stream
//!                                  │
//!                            data events ──► buffer + progress
//!                                  │              │
//!                                  │        [progressive] partial decode
//!                                  ▼              ▼
//!                            final decode    partial process ──► partial
//!                                  │                             callbacks
//!                                  ▼
//!                          processing queue ──► finalize ──► completion
//!                                                            callbacks
//! ```
//!
//! # Concurrency model
//!
//! All mutable registry and session state is owned by a single bookkeeping
//! actor fed by an unbounded message channel; submissions, cancellations,
//! priority updates, and every stage event are messages, so registry
//! operations are race-free by construction. CPU-bound decode and process
//! calls run on the blocking pool, never on the actor. Callbacks are
//! delivered in order on a dedicated delivery task so no caller code runs
//! inside the bookkeeping critical path.

mod actor;

use crate::config::{PipelineConfig, PipelineServices};
use crate::decode::DecodedImage;
use crate::loader::{LoadError, ResponseInfo};
use crate::metrics::{MetricsSnapshot, PipelineMetrics, TaskMetrics};
use crate::request::{ImageRequest, Priority};
use crate::session::SessionId;
use crate::task::{ImageTask, TaskCallbacks, TaskId, TaskProgress};
use bytes::Bytes;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken as RawToken;
use tracing::debug;

/// Messages processed by the bookkeeping actor.
pub(crate) enum PipelineMsg {
    Submit {
        task_id: TaskId,
        request: ImageRequest,
        callbacks: TaskCallbacks,
        progress: Arc<TaskProgress>,
        metrics: Arc<TaskMetrics>,
        cancelled: Arc<AtomicBool>,
    },
    Cancel {
        task_id: TaskId,
    },
    UpdatePriority {
        task_id: TaskId,
        priority: Priority,
    },
    /// A session's fetch was admitted by the rate limiter.
    StartFetch {
        session_id: SessionId,
    },
    FetchData {
        session_id: SessionId,
        chunk: Bytes,
        response: ResponseInfo,
    },
    FetchCompleted {
        session_id: SessionId,
        error: Option<LoadError>,
    },
    PartialDecoded {
        session_id: SessionId,
        image: Option<DecodedImage>,
    },
    PartialProcessed {
        session_id: SessionId,
        image: Option<DecodedImage>,
    },
    FinalDecoded {
        session_id: SessionId,
        image: Option<DecodedImage>,
    },
    FinalProcessed {
        session_id: SessionId,
        image: Option<DecodedImage>,
    },
}

/// Handle shared between the pipeline and its tasks.
///
/// Tasks hold this only weakly; dropping the [`ImagePipeline`] shuts the
/// actor down and turns task operations into no-ops.
pub(crate) struct PipelineShared {
    tx: mpsc::UnboundedSender<PipelineMsg>,
    metrics: Arc<PipelineMetrics>,
}

impl PipelineShared {
    pub(crate) fn send(&self, msg: PipelineMsg) {
        // A send after shutdown is a benign no-op.
        let _ = self.tx.send(msg);
    }
}

/// The coalescing image-loading pipeline.
///
/// Must be created from within a Tokio runtime: construction spawns the
/// bookkeeping actor, the worker pools, and the callback delivery task.
pub struct ImagePipeline {
    shared: Arc<PipelineShared>,
    shutdown: RawToken,
}

impl ImagePipeline {
    /// Creates a pipeline from pluggable capabilities and configuration.
    pub fn new(services: PipelineServices, config: PipelineConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(PipelineMetrics::new());
        let shutdown = RawToken::new();

        let state = actor::PipelineState::new(services, config, Arc::clone(&metrics), tx.clone());
        tokio::spawn(actor::run(state, rx, shutdown.clone()));

        Self {
            shared: Arc::new(PipelineShared { tx, metrics }),
            shutdown,
        }
    }

    /// Submits a load request and returns its task handle immediately.
    ///
    /// Admission — cache probe, coalescing, fetch start — happens
    /// asynchronously on the bookkeeping actor. The handle's callbacks fire
    /// on the pipeline's delivery task.
    pub fn submit(&self, request: ImageRequest, callbacks: TaskCallbacks) -> ImageTask {
        let task_id = TaskId::new();
        let progress = Arc::new(TaskProgress::default());
        let metrics = Arc::new(TaskMetrics::default());
        let cancelled = Arc::new(AtomicBool::new(false));

        metrics.mark_started();
        self.shared.metrics.record_task_submitted();
        debug!(task = %task_id, url = %request.url, "task submitted");

        let url = request.url.clone();
        self.shared.send(PipelineMsg::Submit {
            task_id,
            request,
            callbacks,
            progress: Arc::clone(&progress),
            metrics: Arc::clone(&metrics),
            cancelled: Arc::clone(&cancelled),
        });

        ImageTask::new(
            task_id,
            url,
            progress,
            metrics,
            cancelled,
            Arc::downgrade(&self.shared),
        )
    }

    /// Cancels a task. Equivalent to [`ImageTask::cancel`].
    pub fn cancel(&self, task: &ImageTask) {
        task.cancel();
    }

    /// Updates a task's priority. Equivalent to [`ImageTask::set_priority`].
    pub fn update_priority(&self, task: &ImageTask, priority: Priority) {
        task.set_priority(priority);
    }

    /// Point-in-time copy of the pipeline counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Drop for ImagePipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
