//! Cooperative cancellation for background work.
//!
//! A [`CancelToken`] is the only state shared between the thread that
//! submits a task, the pool thread that runs it, and the main thread
//! that delivers its callbacks. It is two atomics: a cancellation flag
//! and a set-once reference to the worker thread executing the task.
//! Cancelling sets the flag and unparks the captured worker, so
//! background code blocked in [`CancelToken::sleep`] wakes promptly.
//!
//! Cancellation is best-effort: it cannot stop code that never checks
//! the flag. Background code signals its cancellation points by calling
//! [`CancelToken::checkpoint`] or by sleeping through the token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// The unit of work observed that it was cancelled.
///
/// Returned by [`CancelToken::checkpoint`] and [`CancelToken::sleep`] so
/// background code can bail out with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task was cancelled")]
pub struct Cancelled;

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    /// Thread running the background phase; captured once, on first
    /// execution, so `cancel` can wake it.
    worker: OnceLock<Thread>,
}

/// Cloneable cancellation handle shared between submitter, pool thread,
/// and main thread.
///
/// All accesses go through atomic primitives; there is no lock to block
/// a dispatching thread on.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Creates a fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Requests cancellation.
    ///
    /// Sets the flag and, on the first transition only, unparks the
    /// captured worker thread so a blocked [`sleep`](Self::sleep) wakes
    /// early. Returns true if this call performed the transition,
    /// false if the token was already cancelled (idempotent).
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            if let Some(worker) = self.inner.worker.get() {
                debug!(worker = ?worker.name(), "cancelling task, waking worker thread");
                worker.unpark();
            }
        }
        first
    }

    /// Clears the cancellation flag for idempotent reuse.
    ///
    /// Returns true if the flag was set. Used when re-activating a
    /// previously stopped unit of work.
    pub fn reset(&self) -> bool {
        self.inner
            .cancelled
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Records the current thread as the one executing the background
    /// phase. Set-once: later calls are no-ops, matching the invariant
    /// that the owning-thread reference is written by the first run only.
    pub(crate) fn capture_thread(&self) {
        let _ = self.inner.worker.set(thread::current());
    }

    /// Returns `Err(Cancelled)` if cancellation was requested.
    ///
    /// Background code should call this at natural interruption points.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration`, waking early with `Err(Cancelled)` if the
    /// token is cancelled.
    ///
    /// This is the interruption-shaped blocking point for background
    /// code: `cancel` unparks the captured worker, so the full duration
    /// is never waited out after a cancel.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let now = Instant::now();
            let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
            else {
                return Ok(());
            };
            // Spurious wakeups and stale unpark permits are handled by
            // re-checking the flag and the deadline.
            thread::park_timeout(remaining);
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("worker_captured", &self.inner.worker.get().is_some())
            .finish()
    }
}
