//! Single-flight generation gate and per-call deadlines.
//!
//! Both inference backends admit one generation at a time. The gate is a
//! Tokio mutex, which hands out the lock in FIFO order, so queued callers
//! are served in the order they arrived. The guard is owned so it can be
//! moved onto a blocking worker and released there.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::infrastructure::ports::InferenceError;

/// FIFO single-flight gate protecting a backend resource `T`.
pub struct GenerationGate<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for GenerationGate<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> GenerationGate<T> {
    pub fn new(resource: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(resource)),
        }
    }

    /// Wait for the gate. Returns `None` if `cancel` fires while queued.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<OwnedMutexGuard<T>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = Arc::clone(&self.inner).lock_owned() => Some(guard),
        }
    }

    /// Wait for the gate without a cancellation path (teardown).
    pub async fn acquire_unconditionally(&self) -> OwnedMutexGuard<T> {
        Arc::clone(&self.inner).lock_owned().await
    }

    /// Whether a call currently holds the gate.
    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Cancellation for one backend call: fires when the caller cancels or when
/// `timeout` elapses, whichever comes first.
///
/// Dropping the deadline stops its timer; the call token is cancelled at
/// that point too, so anything still watching it winds down.
pub struct CallDeadline {
    token: CancellationToken,
    caller: CancellationToken,
    timeout: Duration,
    _guard: DropGuard,
}

impl CallDeadline {
    pub fn start(caller: &CancellationToken, timeout: Duration) -> Self {
        let token = caller.child_token();
        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => timer.cancel(),
            }
        });

        Self {
            _guard: token.clone().drop_guard(),
            token,
            caller: caller.clone(),
            timeout,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The error describing why the call token fired.
    pub fn error(&self) -> InferenceError {
        if self.caller.is_cancelled() {
            InferenceError::Cancelled
        } else {
            InferenceError::TimedOut(self.timeout)
        }
    }

    /// Run `fut` until it finishes or the deadline fires.
    pub async fn run<F, R>(&self, fut: F) -> Result<R, InferenceError>
    where
        F: std::future::Future<Output = Result<R, InferenceError>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.error()),
            result = fut => result,
        }
    }
}
