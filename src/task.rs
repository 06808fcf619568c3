//! Caller-facing task handles.
//!
//! A task is one logical load request. Many tasks may subscribe to one
//! session; each gets its own progress counters, metrics, and callbacks,
//! and receives exactly one terminal outcome — success, failure, or a
//! silent drop when cancelled.

use crate::decode::DecodedImage;
use crate::error::ImageLoadError;
use crate::metrics::TaskMetrics;
use crate::pipeline::{PipelineMsg, PipelineShared};
use crate::request::Priority;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a task.
///
/// IDs are monotonically increasing and unique within a process lifetime;
/// they correlate log messages and index the session registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Download progress counters shared between the pipeline and the handle.
///
/// `total` is 0 while the content length is unknown.
#[derive(Debug, Default)]
pub struct TaskProgress {
    completed: AtomicU64,
    total: AtomicU64,
}

impl TaskProgress {
    pub(crate) fn set(&self, completed: u64, total: u64) {
        self.completed.store(completed, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    /// Returns `(completed_units, total_units)`.
    pub fn get(&self) -> (u64, u64) {
        (
            self.completed.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

/// The successful terminal payload delivered to subscribers.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub image: DecodedImage,
    /// True when the result came from the result cache without a session.
    pub cache_hit: bool,
}

/// Completion callback: invoked exactly once, unless the task is cancelled
/// first (in which case it is never invoked).
pub type CompletionHandler = Box<dyn FnOnce(Result<ImageResponse, ImageLoadError>) + Send>;

/// Progress callback: `(completed_bytes, total_bytes)`, `total` 0 while
/// unknown.
pub type ProgressHandler = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Progressive-image callback, fired for each delivered partial image.
pub type PartialImageHandler = Arc<dyn Fn(DecodedImage) + Send + Sync>;

/// Optional callback slots attached to a task at submission.
///
/// All callbacks run off the pipeline's internal contexts, on spawned
/// delivery tasks.
#[derive(Default)]
pub struct TaskCallbacks {
    pub(crate) on_completion: Option<CompletionHandler>,
    pub(crate) on_progress: Option<ProgressHandler>,
    pub(crate) on_partial_image: Option<PartialImageHandler>,
}

impl TaskCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_completion<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(Result<ImageResponse, ImageLoadError>) + Send + 'static,
    {
        self.on_completion = Some(Box::new(handler));
        self
    }

    pub fn on_progress<F>(mut self, handler: F) -> Self
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(handler));
        self
    }

    pub fn on_partial_image<F>(mut self, handler: F) -> Self
    where
        F: Fn(DecodedImage) + Send + Sync + 'static,
    {
        self.on_partial_image = Some(Arc::new(handler));
        self
    }
}

/// Handle to one in-flight load request.
///
/// Holds only a weak reference to the pipeline: a retained handle never
/// keeps the pipeline — or the session behind it — alive.
pub struct ImageTask {
    id: TaskId,
    url: String,
    progress: Arc<TaskProgress>,
    metrics: Arc<TaskMetrics>,
    cancelled: Arc<AtomicBool>,
    pipeline: Weak<PipelineShared>,
}

impl ImageTask {
    pub(crate) fn new(
        id: TaskId,
        url: String,
        progress: Arc<TaskProgress>,
        metrics: Arc<TaskMetrics>,
        cancelled: Arc<AtomicBool>,
        pipeline: Weak<PipelineShared>,
    ) -> Self {
        Self {
            id,
            url,
            progress,
            metrics,
            cancelled,
            pipeline,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current `(completed_units, total_units)` progress snapshot.
    pub fn progress(&self) -> (u64, u64) {
        self.progress.get()
    }

    pub fn metrics(&self) -> &Arc<TaskMetrics> {
        &self.metrics
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Cancels this task. Idempotent: only the first call has any effect.
    ///
    /// Cancelling one subscriber never cancels a session other tasks still
    /// subscribe to; only the last subscriber's cancellation tears down the
    /// underlying work.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        // A task that already received its terminal outcome keeps its
        // original metrics; cancelling it afterwards is a plain no-op.
        if self.metrics.completed_at().is_none() {
            self.metrics.mark_cancelled();
            self.metrics.mark_completed();
        }

        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.send(PipelineMsg::Cancel { task_id: self.id });
        }
    }

    /// Updates this task's priority; the owning session re-derives its
    /// effective priority from all subscribers.
    pub fn set_priority(&self, priority: Priority) {
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.send(PipelineMsg::UpdatePriority {
                task_id: self.id,
                priority,
            });
        }
    }
}

impl std::fmt::Debug for ImageTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageTask")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
