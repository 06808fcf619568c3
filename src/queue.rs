//! Bounded-concurrency work queue with live priorities.
//!
//! A fixed pool of workers drains a pending list in priority order with a
//! stable FIFO tie-break. Two properties distinguish this from a plain
//! semaphore-bounded pool:
//!
//! - **Live priorities.** Each item carries a [`SharedPriority`] cell owned
//!   by its session. Workers read the cell when choosing the next item, so
//!   raising a session's priority re-positions its already-queued work
//!   without any explicit re-sort.
//! - **Cancellation-aware.** Each item carries its session's cancellation
//!   token; items cancelled while still queued are dropped at pop time and
//!   never run.
//!
//! Used for both the fetch pool (default 6 workers) and the processing pool
//! (default 2 workers).

use crate::cancellation::CancellationToken;
use crate::request::SharedPriority;
use futures::future::BoxFuture;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken as RawToken;
use tracing::debug;

struct QueuedItem {
    seq: u64,
    priority: SharedPriority,
    token: CancellationToken,
    work: BoxFuture<'static, ()>,
}

struct QueueInner {
    label: &'static str,
    pending: Mutex<Vec<QueuedItem>>,
    /// One permit per submitted item; workers block here when idle.
    ready: Semaphore,
    shutdown: RawToken,
    seq: AtomicU64,
    in_flight: AtomicUsize,
    executed: AtomicU64,
    dropped: AtomicU64,
}

/// Statistics snapshot for a work queue.
#[derive(Debug, Default, Clone)]
pub struct WorkQueueStats {
    pub executed: u64,
    pub dropped: u64,
    pub pending: usize,
    pub in_flight: usize,
}

/// Priority-ordered work queue executed by a fixed worker pool.
pub struct WorkQueue {
    inner: Arc<QueueInner>,
    workers: usize,
}

impl WorkQueue {
    /// Creates the queue and spawns `workers` worker tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(label: &'static str, workers: usize) -> Self {
        assert!(workers > 0, "workers must be > 0");

        let inner = Arc::new(QueueInner {
            label,
            pending: Mutex::new(Vec::new()),
            ready: Semaphore::new(0),
            shutdown: RawToken::new(),
            seq: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        for _ in 0..workers {
            tokio::spawn(worker_loop(Arc::clone(&inner)));
        }

        debug!(label, workers, "work queue started");
        Self { inner, workers }
    }

    /// Submits a unit of work.
    ///
    /// `priority` is read live at scheduling time; `token` drops the item
    /// if it cancels before a worker picks it up.
    pub fn submit(
        &self,
        priority: SharedPriority,
        token: CancellationToken,
        work: BoxFuture<'static, ()>,
    ) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.lock().unwrap().push(QueuedItem {
            seq,
            priority,
            token,
            work,
        });
        self.inner.ready.add_permits(1);
    }

    pub fn label(&self) -> &'static str {
        self.inner.label
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn stats(&self) -> WorkQueueStats {
        WorkQueueStats {
            executed: self.inner.executed.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            pending: self.inner.pending.lock().unwrap().len(),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl QueueInner {
    /// Pops the best runnable item: highest priority, then lowest sequence
    /// number. Items cancelled while queued are discarded here.
    fn pop_best(&self) -> Option<QueuedItem> {
        let mut pending = self.pending.lock().unwrap();

        let before = pending.len();
        pending.retain(|item| !item.token.is_cancelling());
        let discarded = before - pending.len();
        if discarded > 0 {
            self.dropped.fetch_add(discarded as u64, Ordering::Relaxed);
            debug!(label = self.label, discarded, "dropped cancelled queued work");
        }

        let best = pending
            .iter()
            .enumerate()
            .max_by_key(|(_, item)| (item.priority.get(), Reverse(item.seq)))
            .map(|(index, _)| index)?;

        Some(pending.remove(best))
    }
}

async fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        tokio::select! {
            permit = inner.ready.acquire() => match permit {
                Ok(permit) => permit.forget(),
                Err(_) => return,
            },
            _ = inner.shutdown.cancelled() => return,
        }

        // The permit may outnumber live items when cancelled work was
        // discarded in bulk; an empty pop just consumes the surplus.
        let Some(item) = inner.pop_best() else {
            continue;
        };

        inner.in_flight.fetch_add(1, Ordering::Relaxed);
        item.work.await;
        inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        inner.executed.fetch_add(1, Ordering::Relaxed);
    }
}
