//! Session state: the unit of coalesced work for one coalescing key.
//!
//! A session owns the accumulated byte buffer, the retained decoder, the
//! cancellation source, and the subscriber set of however many tasks share
//! it. The pipeline's registry is the sole strong owner; a session is
//! removed exactly once, when its subscriber set empties or when it
//! finalizes.

use crate::cancellation::{CancellationSource, CancellationToken};
use crate::decode::ImageDecoder;
use crate::loader::ResponseInfo;
use crate::metrics::{SessionMetrics, TaskMetrics};
use crate::request::{ImageRequest, Priority, SessionKey, SharedPriority};
use crate::resumable::ResumableData;
use crate::task::{
    CompletionHandler, PartialImageHandler, ProgressHandler, TaskId, TaskProgress,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SessionId(u64);

impl SessionId {
    pub(crate) fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One task's view into a session: its priority, progress, and callbacks.
pub(crate) struct Subscriber {
    pub priority: Priority,
    pub progress: Arc<TaskProgress>,
    pub metrics: Arc<TaskMetrics>,
    pub on_completion: Option<CompletionHandler>,
    pub on_progress: Option<ProgressHandler>,
    pub on_partial_image: Option<PartialImageHandler>,
}

/// In-flight state for one coalescing key.
pub(crate) struct Session {
    pub id: SessionId,
    pub key: SessionKey,
    /// The request that created the session; drives decoder/processor
    /// selection and the cache-write permission.
    pub request: ImageRequest,
    pub source: CancellationSource,
    pub subscribers: HashMap<TaskId, Subscriber>,
    /// Live priority cell shared with queued fetch/processing work.
    pub priority: SharedPriority,
    /// Bytes accumulated so far; cleared once the final decode starts.
    pub buffer: Vec<u8>,
    pub last_response: Option<ResponseInfo>,
    /// Consumed resumable entry, held until the first response confirms or
    /// rejects resumption.
    pub resumable: Option<ResumableData>,
    /// Offset the buffer was seeded with after a confirmed resume.
    pub resumed_bytes: u64,
    /// Decoder selected on first bytes and retained for the session.
    pub decoder: Option<Arc<dyn ImageDecoder>>,
    pub partial_decode_in_flight: bool,
    /// At most one partial-processing unit runs per session; this is its
    /// cancellation source while it does.
    pub partial_processing: Option<CancellationSource>,
    pub completed: bool,
    pub metrics: Arc<SessionMetrics>,
}

impl Session {
    pub(crate) fn new(key: SessionKey, request: ImageRequest) -> Self {
        let priority = SharedPriority::new(request.priority);
        Self {
            id: SessionId::new(),
            key,
            request,
            source: CancellationSource::new(),
            subscribers: HashMap::new(),
            priority,
            buffer: Vec::new(),
            last_response: None,
            resumable: None,
            resumed_bytes: 0,
            decoder: None,
            partial_decode_in_flight: false,
            partial_processing: None,
            completed: false,
            metrics: Arc::new(SessionMetrics::default()),
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.source.token()
    }

    pub(crate) fn attach(&mut self, task_id: TaskId, subscriber: Subscriber) {
        self.subscribers.insert(task_id, subscriber);
        self.sync_priority();
    }

    pub(crate) fn detach(&mut self, task_id: TaskId) -> Option<Subscriber> {
        let subscriber = self.subscribers.remove(&task_id);
        self.sync_priority();
        subscriber
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// The maximum priority across current subscribers, `Normal` if the set
    /// is empty (an empty session is torn down immediately anyway).
    pub(crate) fn max_priority(&self) -> Priority {
        self.subscribers
            .values()
            .map(|s| s.priority)
            .max()
            .unwrap_or(Priority::Normal)
    }

    /// Re-applies the max-priority rule to the shared cell, re-ordering any
    /// queued fetch/processing work.
    pub(crate) fn sync_priority(&self) {
        self.priority.set(self.max_priority());
    }

    /// Declared total length of the resource: the latest response's content
    /// length plus the resumed offset, when known.
    pub(crate) fn total_expected(&self) -> Option<u64> {
        self.last_response
            .as_ref()
            .and_then(|r| r.content_length)
            .map(|remaining| remaining + self.resumed_bytes)
    }

    /// Current `(completed_units, total_units)`, with 0 for an unknown
    /// total.
    pub(crate) fn progress_units(&self) -> (u64, u64) {
        (self.buffer.len() as u64, self.total_expected().unwrap_or(0))
    }
}
