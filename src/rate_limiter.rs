//! Token-bucket admission control for new fetch work.
//!
//! Rapid start/cancel churn — a caller scrolling through hundreds of images
//! and cancelling most of them — would otherwise hit the transport with a
//! burst of fetches that are dead on arrival. The limiter absorbs that
//! churn: each admitted unit of work consumes a bucket token; when the
//! bucket is empty, work queues and is released at the replenishment rate.
//! Queued items carry their session's cancellation token and are dropped at
//! release time if that token has fired, so cancelled bursts never reach
//! the fetch queue at all.
//!
//! Disabled (the default) the limiter is a pass-through: work executes
//! immediately with no queuing. It is a backpressure valve, never a
//! correctness requirement.

use crate::cancellation::CancellationToken;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken as RawToken;
use tracing::debug;

/// Replenishment configuration for the token bucket.
#[derive(Debug, Clone)]
pub struct RateLimit {
    /// Tokens replenished per second.
    pub rate_per_second: f64,
    /// Bucket capacity: the largest burst admitted without queuing.
    pub burst: f64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            rate_per_second: 80.0,
            burst: 25.0,
        }
    }
}

type Work = Box<dyn FnOnce() + Send>;

struct Pending {
    token: CancellationToken,
    work: Work,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    queue: VecDeque<Pending>,
    /// True while a drain task is running.
    draining: bool,
}

struct LimiterInner {
    enabled: bool,
    limit: RateLimit,
    state: Mutex<BucketState>,
    shutdown: RawToken,
    executed: AtomicU64,
    throttled: AtomicU64,
    dropped: AtomicU64,
}

/// Statistics snapshot for the limiter.
#[derive(Debug, Default, Clone)]
pub struct RateLimiterStats {
    /// Units of work that ran (immediately or after queuing).
    pub executed: u64,
    /// Units of work that had to queue.
    pub throttled: u64,
    /// Queued units dropped because their session was cancelled first.
    pub dropped: u64,
}

/// Token-bucket limiter for new underlying work starts.
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    pub fn new(enabled: bool, limit: RateLimit) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                enabled,
                state: Mutex::new(BucketState {
                    tokens: limit.burst,
                    last_refill: Instant::now(),
                    queue: VecDeque::new(),
                    draining: false,
                }),
                limit,
                shutdown: RawToken::new(),
                executed: AtomicU64::new(0),
                throttled: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// A disabled, pass-through limiter.
    pub fn disabled() -> Self {
        Self::new(false, RateLimit::default())
    }

    /// Runs `work` now if a token is available (or the limiter is
    /// disabled); otherwise queues it for release at the replenishment
    /// rate. A queued item whose `token` cancels first is dropped without
    /// ever starting.
    pub fn execute(&self, token: CancellationToken, work: Work) {
        if !self.inner.enabled {
            self.inner.executed.fetch_add(1, Ordering::Relaxed);
            work();
            return;
        }

        let immediate = {
            let mut state = self.inner.state.lock().unwrap();
            Self::refill(&self.inner.limit, &mut state);

            if state.queue.is_empty() && state.tokens >= 1.0 {
                state.tokens -= 1.0;
                Some(work)
            } else {
                state.queue.push_back(Pending { token, work });
                self.inner.throttled.fetch_add(1, Ordering::Relaxed);
                if !state.draining {
                    state.draining = true;
                    tokio::spawn(drain_loop(Arc::clone(&self.inner)));
                }
                None
            }
        };

        if let Some(work) = immediate {
            self.inner.executed.fetch_add(1, Ordering::Relaxed);
            work();
        }
    }

    /// Replenishes the bucket from elapsed time, capped at the burst size.
    fn refill(limit: &RateLimit, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * limit.rate_per_second).min(limit.burst);
        state.last_refill = now;
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            executed: self.inner.executed.load(Ordering::Relaxed),
            throttled: self.inner.throttled.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// Number of items currently queued behind the bucket.
    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn drain_loop(inner: Arc<LimiterInner>) {
    let period = Duration::from_secs_f64(1.0 / inner.limit.rate_per_second.max(1.0));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = inner.shutdown.cancelled() => {
                inner.state.lock().unwrap().draining = false;
                return;
            }
        }

        let (runnable, done) = {
            let mut state = inner.state.lock().unwrap();
            RateLimiter::refill(&inner.limit, &mut state);

            let mut runnable = Vec::new();
            while state.tokens >= 1.0 {
                match state.queue.pop_front() {
                    Some(pending) => {
                        if pending.token.is_cancelling() {
                            inner.dropped.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        state.tokens -= 1.0;
                        runnable.push(pending.work);
                    }
                    None => break,
                }
            }

            let done = state.queue.is_empty();
            if done {
                state.draining = false;
            }
            (runnable, done)
        };

        for work in runnable {
            inner.executed.fetch_add(1, Ordering::Relaxed);
            work();
        }

        if done {
            debug!("rate limiter queue drained");
            return;
        }
    }
}
