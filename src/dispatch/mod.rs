//! Single-threaded, ordered, delayed-dispatch queues.
//!
//! A [`Dispatcher`] owns one named thread that drains a time-ordered
//! queue: the in-process equivalent of a platform main-thread queue.
//! The registry designates one dispatcher as the main queue; additional
//! dispatchers can be started as serial background queues when a set of
//! tasks must be confined to one thread.
//!
//! Guarantees:
//!
//! - FIFO delivery among entries with equal due times, on exactly one
//!   thread.
//! - Delays are honored via `Condvar::wait_until`; an earlier-due entry
//!   posted later wakes the thread up.
//! - Not-yet-fired entries can be removed by identity
//!   ([`DispatchHandle::remove`]).
//! - Sync barriers hold back normal entries while barrier-exempt
//!   entries (posted via [`Dispatcher::async_handle`]) keep flowing.
//! - A panicking callback is caught and logged; the queue thread
//!   survives. Well-behaved callers still should not panic on the
//!   dispatch thread — everything behind it is delayed while a
//!   misbehaving callback runs.

mod handle;
mod queue;

pub use handle::{BarrierToken, DispatchHandle, DispatchToken};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use queue::{QueueState, Selection};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct DispatcherShared {
    name: String,
    state: Mutex<QueueState>,
    cond: Condvar,
    thread_id: OnceLock<ThreadId>,
    next_token: AtomicU64,
}

/// A dispatcher thread plus its queue.
///
/// Dropping the dispatcher shuts the thread down and discards
/// undelivered entries.
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Starts a dispatcher thread with the given name.
    ///
    /// If the OS refuses to spawn the thread the dispatcher comes up
    /// closed: posts are logged and dropped rather than queued forever.
    pub fn start(name: impl Into<String>) -> Self {
        let shared = Arc::new(DispatcherShared {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
            thread_id: OnceLock::new(),
            next_token: AtomicU64::new(1),
        });
        let loop_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || drain(loop_shared));
        let thread = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(queue = %shared.name, error = %e, "failed to spawn dispatcher thread");
                shared.state.lock().closed = true;
                None
            }
        };
        Self {
            shared,
            thread: Mutex::new(thread),
        }
    }

    /// Handle posting normal (barrier-gated) entries.
    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            shared: Arc::clone(&self.shared),
            exempt: false,
        }
    }

    /// Handle posting barrier-exempt entries. Same thread, same FIFO
    /// ordering; entries skip past installed sync barriers.
    pub fn async_handle(&self) -> DispatchHandle {
        DispatchHandle {
            shared: Arc::clone(&self.shared),
            exempt: true,
        }
    }

    /// Stops the dispatcher thread, discarding undelivered entries.
    ///
    /// Safe to call multiple times. When invoked from the dispatcher's
    /// own thread the join is skipped; the thread exits once the
    /// current callback returns.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.cond.notify_all();
        let on_own_thread =
            self.shared.thread_id.get().copied() == Some(thread::current().id());
        if on_own_thread {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!(queue = %self.shared.name, "dispatcher thread terminated abnormally");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.shared.name)
            .finish()
    }
}

fn drain(shared: Arc<DispatcherShared>) {
    let _ = shared.thread_id.set(thread::current().id());
    debug!(queue = %shared.name, "dispatcher thread started");
    loop {
        let entry = {
            let mut state = shared.state.lock();
            loop {
                if state.closed {
                    let dropped = state.pending_len();
                    if dropped > 0 {
                        debug!(queue = %shared.name, dropped, "dispatcher shutting down with pending entries");
                    }
                    return;
                }
                match state.select(Instant::now()) {
                    Selection::Run(entry) => break entry,
                    Selection::WaitUntil(due) => {
                        let _ = shared.cond.wait_until(&mut state, due);
                    }
                    Selection::Idle => shared.cond.wait(&mut state),
                }
            }
        };
        // The lock is released while user code runs.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry.job)) {
            error!(
                queue = %shared.name,
                panic = %crate::panic::message(&payload),
                "dispatched callback panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_posts_run_on_dispatcher_thread_in_order() {
        let dispatcher = Dispatcher::start("test-dispatch");
        let handle = dispatcher.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = crossbeam_channel::bounded(1);
        for i in 0..10 {
            let order = Arc::clone(&order);
            let probe = handle.clone();
            handle.post(move || {
                order.lock().push((i, probe.is_current_thread()));
            });
        }
        handle.post(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let observed = order.lock().clone();
        assert_eq!(
            observed,
            (0..10).map(|i| (i, true)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_delayed_post_fires_no_earlier_than_delay() {
        let dispatcher = Dispatcher::start("test-delay");
        let handle = dispatcher.handle();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let posted_at = Instant::now();
        handle.post_delayed(
            move || {
                let _ = tx.send(Instant::now());
            },
            Duration::from_millis(80),
        );
        let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired_at.duration_since(posted_at) >= Duration::from_millis(80));
    }

    #[test]
    fn test_removed_entry_never_fires() {
        let dispatcher = Dispatcher::start("test-remove");
        let handle = dispatcher.handle();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let token = handle.post_delayed(
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(50),
        );
        assert!(handle.remove(token));
        assert!(!handle.remove(token));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_async_handle_bypasses_barrier() {
        let dispatcher = Dispatcher::start("test-barrier");
        let handle = dispatcher.handle();
        let async_handle = dispatcher.async_handle();
        let barrier = handle.post_barrier();

        let log = Arc::new(Mutex::new(Vec::new()));
        let log_sync = Arc::clone(&log);
        handle.post(move || log_sync.lock().push("sync"));
        let log_async = Arc::clone(&log);
        let (tx, rx) = crossbeam_channel::bounded(1);
        async_handle.post(move || {
            log_async.lock().push("async");
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*log.lock(), vec!["async"]);

        let (tx2, rx2) = crossbeam_channel::bounded(1);
        assert!(handle.remove_barrier(barrier));
        let log_done = Arc::clone(&log);
        handle.post(move || {
            log_done.lock().push("after");
            let _ = tx2.send(());
        });
        rx2.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*log.lock(), vec!["async", "sync", "after"]);
    }

    #[test]
    fn test_panicking_callback_keeps_queue_alive() {
        let dispatcher = Dispatcher::start("test-callback-panic");
        let handle = dispatcher.handle();
        handle.post(|| panic!("callback exploded"));
        let (tx, rx) = crossbeam_channel::bounded(1);
        handle.post(move || {
            let _ = tx.send(7);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_shutdown_drops_pending_entries() {
        let dispatcher = Dispatcher::start("test-shutdown");
        let handle = dispatcher.handle();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        handle.post_delayed(
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(100),
        );
        dispatcher.shutdown();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
