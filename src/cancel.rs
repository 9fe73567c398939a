//! Cooperative cancellation tokens.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::error::{LoadError, LoadResult};

/// Shared cancellation flag passed through fetch and decode calls.
///
/// Cloning shares the flag. The engine triggers an execution's token only
/// when the last waiter cancels; fetchers race their I/O against
/// [`CancelToken::cancelled`] and decoders call [`CancelToken::check`] at
/// stage boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Creates a live token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers cancellation and wakes every pending waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns true once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once cancelled.
    ///
    /// # Errors
    /// [`LoadError::Cancelled`] after [`CancelToken::cancel`] ran.
    pub fn check(&self) -> LoadResult<()> {
        if self.is_cancelled() {
            Err(LoadError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Completes when the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Created before the flag check so a cancel() landing in
            // between still wakes this future.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
