//! Broadcast-once cancellation primitive.
//!
//! Every session owns a [`CancellationSource`]; the derived
//! [`CancellationToken`] is threaded through the fetch, decode, and
//! processing units spawned on the session's behalf. Cancelling the source
//! tears all of them down without any of them polling a flag: each unit
//! either checks the token at its own safe points or registers a teardown
//! handler that fires exactly once.
//!
//! # Semantics
//!
//! - `cancel()` is idempotent and irreversible.
//! - Handlers registered via [`CancellationToken::register`] run exactly
//!   once, in registration order: synchronously inside `cancel()`, or
//!   synchronously at `register` time if the source was already cancelled.
//! - [`CancellationToken::cancelled`] is an async wait suitable for
//!   `tokio::select!`, so in-flight I/O can race the token against its work.
//!
//! No operation is force-terminated; cancellation is cooperative.

use std::sync::Arc;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken as RawToken;

/// A handler invoked when the owning source is cancelled.
type CancelHandler = Box<dyn FnOnce() + Send>;

enum HandlerState {
    /// Not yet cancelled; handlers wait here in registration order.
    Pending(Vec<CancelHandler>),
    /// Cancelled; every handler has already run.
    Fired,
}

struct Inner {
    /// Wakeable flag; `cancelled().await` integrates with `tokio::select!`.
    flag: RawToken,
    handlers: Mutex<HandlerState>,
}

/// Owning side of the cancellation pair. Created once per session.
pub struct CancellationSource {
    inner: Arc<Inner>,
}

/// Observing side, cheaply cloneable into every unit of work.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationSource {
    /// Creates a new, uncancelled source.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: RawToken::new(),
                handlers: Mutex::new(HandlerState::Pending(Vec::new())),
            }),
        }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Cancels the source, running every registered handler in registration
    /// order. Subsequent calls are no-ops.
    pub fn cancel(&self) {
        let drained = {
            let mut state = self.inner.handlers.lock().unwrap();
            match std::mem::replace(&mut *state, HandlerState::Fired) {
                HandlerState::Pending(handlers) => handlers,
                HandlerState::Fired => return,
            }
        };

        // Flip the flag before running handlers so `is_cancelling` observed
        // from inside a handler already reads true.
        self.inner.flag.cancel();

        for handler in drained {
            handler();
        }
    }

    /// True once `cancel` has been called.
    pub fn is_cancelling(&self) -> bool {
        self.inner.flag.is_cancelled()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSource")
            .field("is_cancelling", &self.is_cancelling())
            .finish()
    }
}

impl CancellationToken {
    /// True once the owning source has been cancelled.
    pub fn is_cancelling(&self) -> bool {
        self.inner.flag.is_cancelled()
    }

    /// Completes when the owning source is cancelled.
    pub async fn cancelled(&self) {
        self.inner.flag.cancelled().await;
    }

    /// Registers a teardown handler.
    ///
    /// If the source is already cancelled, `handler` runs synchronously
    /// before this call returns. Otherwise it runs inside `cancel()`, after
    /// every handler registered before it.
    pub fn register<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let run_now = {
            let mut state = self.inner.handlers.lock().unwrap();
            match &mut *state {
                HandlerState::Pending(handlers) => {
                    handlers.push(Box::new(handler));
                    None
                }
                HandlerState::Fired => Some(handler),
            }
        };

        if let Some(handler) = run_now {
            handler();
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("is_cancelling", &self.is_cancelling())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_not_cancelled_initially() {
        let source = CancellationSource::new();
        assert!(!source.is_cancelling());
        assert!(!source.token().is_cancelling());
    }

    #[test]
    fn test_cancel_flips_all_tokens() {
        let source = CancellationSource::new();
        let a = source.token();
        let b = source.token();

        source.cancel();

        assert!(a.is_cancelling());
        assert!(b.is_cancelling());
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let source = CancellationSource::new();
        let token = source.token();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let order = Arc::clone(&order);
            token.register(move || order.lock().unwrap().push(i));
        }

        source.cancel();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_register_after_cancel_runs_synchronously() {
        let source = CancellationSource::new();
        source.cancel();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        source.token().register(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let source = CancellationSource::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        source.token().register(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        source.cancel();
        source.cancel();
        source.cancel();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_observes_cancelling_state() {
        let source = CancellationSource::new();
        let token = source.token();
        let observed = Arc::new(Mutex::new(false));

        let observed_clone = Arc::clone(&observed);
        let probe = token.clone();
        token.register(move || {
            *observed_clone.lock().unwrap() = probe.is_cancelling();
        });

        source.cancel();
        assert!(*observed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_wait_completes() {
        let source = CancellationSource::new();
        let token = source.token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        source.cancel();
        handle.await.expect("waiter should complete");
    }
}
