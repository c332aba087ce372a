//! Posting handles for a [`Dispatcher`](super::Dispatcher).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use super::DispatcherShared;

/// Identity of a posted unit of work; used to remove it before it fires.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DispatchToken(pub(crate) u64);

/// Identity of an installed sync barrier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BarrierToken(pub(crate) u64);

/// Cloneable handle posting work onto a dispatcher thread.
///
/// All work posted through any handle of the same dispatcher executes
/// strictly on that dispatcher's single thread, in FIFO order among
/// entries with equal due times. Handles vended by
/// [`Dispatcher::async_handle`](super::Dispatcher::async_handle) post
/// barrier-exempt entries; everything else about them is identical.
#[derive(Clone)]
pub struct DispatchHandle {
    pub(super) shared: Arc<DispatcherShared>,
    pub(super) exempt: bool,
}

impl DispatchHandle {
    /// Posts a unit of work for immediate dispatch.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> DispatchToken {
        self.post_delayed(job, Duration::ZERO)
    }

    /// Posts a unit of work to run after `delay`.
    ///
    /// Posting to a shut-down dispatcher logs a warning and drops the
    /// work; the returned token is inert.
    pub fn post_delayed(
        &self,
        job: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> DispatchToken {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        let due = Instant::now() + delay;
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                warn!(queue = %self.shared.name, "post to shut-down dispatcher dropped");
                return DispatchToken(token);
            }
            state.push(due, token, self.exempt, Box::new(job));
        }
        self.shared.cond.notify_all();
        DispatchToken(token)
    }

    /// Removes a not-yet-fired entry by identity.
    ///
    /// Returns true if the entry was still pending and is now guaranteed
    /// never to run; false if it already ran, was already removed, or
    /// never belonged to this dispatcher.
    pub fn remove(&self, token: DispatchToken) -> bool {
        self.shared.state.lock().remove(token.0)
    }

    /// Installs a sync barrier: entries posted through non-exempt
    /// handles are held back until the barrier is removed.
    pub fn post_barrier(&self) -> BarrierToken {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        self.shared.state.lock().push_barrier(token);
        BarrierToken(token)
    }

    /// Removes a previously installed barrier. Returns whether it was
    /// still active.
    pub fn remove_barrier(&self, token: BarrierToken) -> bool {
        let removed = self.shared.state.lock().remove_barrier(token.0);
        if removed {
            self.shared.cond.notify_all();
        }
        removed
    }

    /// True when called from the dispatcher's own thread.
    pub fn is_current_thread(&self) -> bool {
        self.shared.thread_id.get().copied() == Some(thread::current().id())
    }

    /// Number of entries currently awaiting dispatch.
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending_len()
    }

    /// The dispatcher's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl std::fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandle")
            .field("queue", &self.shared.name)
            .field("barrier_exempt", &self.exempt)
            .finish()
    }
}
