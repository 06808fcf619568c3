//! Pipeline observability: lock-free counters plus per-task and per-session
//! timing records. Purely observational; nothing here influences control
//! flow.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Timing and outcome record for one task.
#[derive(Debug, Default)]
pub struct TaskMetrics {
    started_at: Mutex<Option<Instant>>,
    completed_at: Mutex<Option<Instant>>,
    was_deduplicated: AtomicBool,
    was_cache_hit: AtomicBool,
    was_cancelled: AtomicBool,
}

impl TaskMetrics {
    pub(crate) fn mark_started(&self) {
        *self.started_at.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn mark_completed(&self) {
        *self.completed_at.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn mark_deduplicated(&self) {
        self.was_deduplicated.store(true, Ordering::Relaxed);
    }

    pub(crate) fn mark_cache_hit(&self) {
        self.was_cache_hit.store(true, Ordering::Relaxed);
    }

    pub(crate) fn mark_cancelled(&self) {
        self.was_cancelled.store(true, Ordering::Relaxed);
    }

    pub fn started_at(&self) -> Option<Instant> {
        *self.started_at.lock().unwrap()
    }

    pub fn completed_at(&self) -> Option<Instant> {
        *self.completed_at.lock().unwrap()
    }

    /// True when this task attached to an already-running session.
    pub fn was_deduplicated(&self) -> bool {
        self.was_deduplicated.load(Ordering::Relaxed)
    }

    /// True when the result came straight from the result cache.
    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit.load(Ordering::Relaxed)
    }

    pub fn was_cancelled(&self) -> bool {
        self.was_cancelled.load(Ordering::Relaxed)
    }
}

/// Timing record for one session's fetch/decode/process chain.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    fetch_started_at: Mutex<Option<Instant>>,
    fetch_finished_at: Mutex<Option<Instant>>,
    decode_finished_at: Mutex<Option<Instant>>,
    process_finished_at: Mutex<Option<Instant>>,
    bytes_downloaded: AtomicU64,
    was_resumed: AtomicBool,
}

impl SessionMetrics {
    pub(crate) fn mark_fetch_started(&self) {
        *self.fetch_started_at.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn mark_fetch_finished(&self) {
        *self.fetch_finished_at.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn mark_decode_finished(&self) {
        *self.decode_finished_at.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn mark_process_finished(&self) {
        *self.process_finished_at.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn add_bytes(&self, count: u64) {
        self.bytes_downloaded.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn mark_resumed(&self) {
        self.was_resumed.store(true, Ordering::Relaxed);
    }

    pub fn fetch_started_at(&self) -> Option<Instant> {
        *self.fetch_started_at.lock().unwrap()
    }

    pub fn fetch_finished_at(&self) -> Option<Instant> {
        *self.fetch_finished_at.lock().unwrap()
    }

    pub fn decode_finished_at(&self) -> Option<Instant> {
        *self.decode_finished_at.lock().unwrap()
    }

    pub fn process_finished_at(&self) -> Option<Instant> {
        *self.process_finished_at.lock().unwrap()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    /// True when the fetch continued from saved partial bytes.
    pub fn was_resumed(&self) -> bool {
        self.was_resumed.load(Ordering::Relaxed)
    }
}

/// Lock-free counters for the whole pipeline.
///
/// All operations use `Relaxed` ordering; the counters are independent
/// measurements and need no ordering between each other.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    // === Task counters ===
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_cancelled: AtomicU64,
    /// Tasks that attached to an existing session instead of starting work.
    tasks_coalesced: AtomicU64,

    // === Session counters ===
    sessions_created: AtomicU64,
    sessions_torn_down: AtomicU64,

    // === Cache counters ===
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    // === Fetch counters ===
    fetches_started: AtomicU64,
    bytes_downloaded: AtomicU64,

    // === Progressive / resumable counters ===
    partial_images_delivered: AtomicU64,
    resumable_saves: AtomicU64,
    resumable_resumes: AtomicU64,
    resumable_rejected: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $read:ident) => {
        pub(crate) fn $record(&self) {
            self.$read.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $read(&self) -> u64 {
            self.$read.load(Ordering::Relaxed)
        }
    };
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_task_submitted, tasks_submitted);
    counter!(record_task_completed, tasks_completed);
    counter!(record_task_failed, tasks_failed);
    counter!(record_task_cancelled, tasks_cancelled);
    counter!(record_task_coalesced, tasks_coalesced);
    counter!(record_session_created, sessions_created);
    counter!(record_session_torn_down, sessions_torn_down);
    counter!(record_cache_hit, cache_hits);
    counter!(record_cache_miss, cache_misses);
    counter!(record_fetch_started, fetches_started);
    counter!(record_partial_image_delivered, partial_images_delivered);
    counter!(record_resumable_save, resumable_saves);
    counter!(record_resumable_resume, resumable_resumes);
    counter!(record_resumable_rejected, resumable_rejected);

    pub(crate) fn record_bytes_downloaded(&self, count: u64) {
        self.bytes_downloaded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_submitted: self.tasks_submitted(),
            tasks_completed: self.tasks_completed(),
            tasks_failed: self.tasks_failed(),
            tasks_cancelled: self.tasks_cancelled(),
            tasks_coalesced: self.tasks_coalesced(),
            sessions_created: self.sessions_created(),
            sessions_torn_down: self.sessions_torn_down(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            fetches_started: self.fetches_started(),
            bytes_downloaded: self.bytes_downloaded(),
            partial_images_delivered: self.partial_images_delivered(),
            resumable_saves: self.resumable_saves(),
            resumable_resumes: self.resumable_resumes(),
            resumable_rejected: self.resumable_rejected(),
        }
    }
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_coalesced: u64,
    pub sessions_created: u64,
    pub sessions_torn_down: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fetches_started: u64,
    pub bytes_downloaded: u64,
    pub partial_images_delivered: u64,
    pub resumable_saves: u64,
    pub resumable_resumes: u64,
    pub resumable_rejected: u64,
}

impl MetricsSnapshot {
    /// Fraction of submissions that shared an existing session.
    pub fn coalescing_ratio(&self) -> f64 {
        if self.tasks_submitted == 0 {
            0.0
        } else {
            self.tasks_coalesced as f64 / self.tasks_submitted as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_metrics_flags() {
        let metrics = TaskMetrics::default();
        assert!(!metrics.was_deduplicated());
        assert!(!metrics.was_cache_hit());
        assert!(!metrics.was_cancelled());

        metrics.mark_deduplicated();
        metrics.mark_cache_hit();
        metrics.mark_cancelled();

        assert!(metrics.was_deduplicated());
        assert!(metrics.was_cache_hit());
        assert!(metrics.was_cancelled());
    }

    #[test]
    fn test_task_metrics_timestamps() {
        let metrics = TaskMetrics::default();
        assert!(metrics.started_at().is_none());

        metrics.mark_started();
        metrics.mark_completed();

        let started = metrics.started_at().expect("started stamp");
        let completed = metrics.completed_at().expect("completed stamp");
        assert!(completed >= started);
    }

    #[test]
    fn test_session_metrics_bytes() {
        let metrics = SessionMetrics::default();
        metrics.add_bytes(100);
        metrics.add_bytes(28);
        assert_eq!(metrics.bytes_downloaded(), 128);
    }

    #[test]
    fn test_snapshot_and_coalescing_ratio() {
        let metrics = PipelineMetrics::new();

        for _ in 0..4 {
            metrics.record_task_submitted();
        }
        metrics.record_task_coalesced();
        metrics.record_task_coalesced();
        metrics.record_task_coalesced();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_submitted, 4);
        assert_eq!(snapshot.tasks_coalesced, 3);
        assert!((snapshot.coalescing_ratio() - 0.75).abs() < 0.001);
    }
}
