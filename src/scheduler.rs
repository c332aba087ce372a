//! The scheduling facade.
//!
//! [`TaskScheduler`] is the one type most embedders touch: it routes
//! fire-and-forget closures and cancellable [`Task`]s to the registry's
//! pools, posts callbacks (plain, delayed, or lifecycle-bound) to the
//! main queue, and activates periodic tasks.
//!
//! The scheduler is a thin, cloneable wrapper over an injected
//! `Arc<PoolRegistry>` — there is no ambient global. Tests construct
//! their own registry; an application typically builds one at startup
//! and clones the scheduler wherever work is submitted.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use threadline::cancel::CancelToken;
//! use threadline::registry::PoolRegistry;
//! use threadline::scheduler::TaskScheduler;
//! use threadline::task::{ClosureTask, TaskFailure};
//!
//! let scheduler = TaskScheduler::new(Arc::new(PoolRegistry::new()));
//! let handle = scheduler.submit(ClosureTask::new(
//!     |token: &CancelToken| {
//!         token.checkpoint()?;
//!         Ok::<_, TaskFailure>(6 * 7)
//!     },
//!     |answer| println!("computed {answer}"),
//! ));
//! // Later, perhaps:
//! handle.cancel();
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::dispatch::{DispatchHandle, DispatchToken, Dispatcher};
use crate::error::SchedulerError;
use crate::lifecycle::{BoundDispatch, BoundHandle, Lifecycle, LifecycleEvent};
use crate::periodic::PeriodicTask;
use crate::pool::ThreadPool;
use crate::registry::PoolRegistry;
use crate::task::{self, Task, TaskCell, TaskHandle};

/// Facade over a [`PoolRegistry`]: submission, callbacks, periodics.
#[derive(Clone)]
pub struct TaskScheduler {
    registry: Arc<PoolRegistry>,
}

impl TaskScheduler {
    /// Wraps an injected registry.
    pub fn new(registry: Arc<PoolRegistry>) -> Self {
        Self { registry }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Fire-and-forget on the parallel (CPU-bound) pool.
    pub fn execute(&self, f: impl FnOnce() + Send + 'static) {
        self.registry.parallel().execute(f);
    }

    /// Fire-and-forget on the timeout (blocking I/O) pool.
    pub fn execute_io(&self, f: impl FnOnce() + Send + 'static) {
        self.registry.timeout().execute(f);
    }

    /// Submits a cancellable task to the parallel pool.
    pub fn submit<T: Task>(&self, task: T) -> TaskHandle<T> {
        self.submit_on(self.registry.parallel(), task)
    }

    /// Submits a cancellable task to the timeout pool.
    pub fn submit_io<T: Task>(&self, task: T) -> TaskHandle<T> {
        self.submit_on(self.registry.timeout(), task)
    }

    /// Submits a task with an advisory timeout.
    ///
    /// The task runs on the timeout pool; a second timeout-pool job
    /// parks on the task's completion latch. If the background phase
    /// has not ended within `timeout`, the monitor requests
    /// cancellation exactly as [`TaskHandle::cancel`] would: the flag
    /// is set, the worker is woken, `on_cancel` is posted, and the
    /// completion callbacks are suppressed. The timeout is advisory —
    /// a background phase that never checks its token runs to
    /// completion regardless, it just no longer reports.
    pub fn submit_with_timeout<T: Task>(&self, timeout: Duration, task: T) -> TaskHandle<T> {
        let cell = Arc::new(TaskCell::new(task));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        cell.arm_done_latch(done_tx);
        let main = self.registry.main_handle();
        let handle = TaskHandle::new(Arc::clone(&cell), main.clone());
        self.registry
            .timeout()
            .execute(move || task::run_background(&cell, &main));
        let monitor = handle.clone();
        self.registry.timeout().execute(move || {
            if done_rx.recv_timeout(timeout).is_err() && !monitor.is_cancelled() {
                warn!(?timeout, "task exceeded advisory timeout; requesting cancellation");
                monitor.cancel();
            }
        });
        handle
    }

    /// Requests cancellation of a submitted task. Equivalent to
    /// [`TaskHandle::cancel`]; kept on the facade for call-site symmetry
    /// with [`submit`](Self::submit).
    pub fn cancel<T: Task>(&self, handle: &TaskHandle<T>) {
        handle.cancel();
    }

    /// Activates a periodic task on a fresh dedicated timer.
    pub fn schedule(&self, task: &Arc<PeriodicTask>) {
        self.registry.start_periodic(task);
    }

    /// Stops a periodic task. Returns true if this call performed the
    /// stop transition.
    pub fn stop_schedule(&self, task: &PeriodicTask) -> bool {
        task.stop()
    }

    /// Posts a callback to the main queue.
    pub fn run_on_main(&self, f: impl FnOnce() + Send + 'static) -> DispatchToken {
        self.registry.main_handle().post(f)
    }

    /// Posts a delayed callback to the main queue.
    pub fn run_on_main_delayed(
        &self,
        f: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> DispatchToken {
        self.registry.main_handle().post_delayed(f, delay)
    }

    /// Removes a not-yet-fired main-queue callback.
    pub fn remove_main_callback(&self, token: DispatchToken) -> bool {
        self.registry.main_handle().remove(token)
    }

    /// Posts a callback to the main queue, bound to a lifecycle: if the
    /// lifecycle is destroyed first, the callback never runs.
    pub fn run_on_main_bound(
        &self,
        lifecycle: &Arc<Lifecycle>,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<BoundHandle, SchedulerError> {
        self.run_on_main_bound_with(lifecycle, LifecycleEvent::Destroy, Duration::ZERO, f)
    }

    /// [`run_on_main_bound`](Self::run_on_main_bound) with an explicit
    /// terminal event and delay.
    pub fn run_on_main_bound_with(
        &self,
        lifecycle: &Arc<Lifecycle>,
        terminal: LifecycleEvent,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<BoundHandle, SchedulerError> {
        self.run_bound(&self.registry.main_handle(), lifecycle, terminal, delay, f)
    }

    /// Lifecycle-bound post to an explicit queue (a serial dispatcher
    /// from [`new_serial_dispatcher`](Self::new_serial_dispatcher), or
    /// the main queue).
    pub fn run_bound(
        &self,
        queue: &DispatchHandle,
        lifecycle: &Arc<Lifecycle>,
        terminal: LifecycleEvent,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<BoundHandle, SchedulerError> {
        BoundDispatch::bind(queue, lifecycle, terminal, delay, f)
    }

    /// True when called on the main queue's thread.
    pub fn is_main_thread(&self) -> bool {
        self.registry.main_handle().is_current_thread()
    }

    /// Handle posting to the main queue.
    pub fn main_handle(&self) -> DispatchHandle {
        self.registry.main_handle()
    }

    /// Barrier-exempt handle to the main queue.
    pub fn async_main_handle(&self) -> DispatchHandle {
        self.registry.async_main_handle()
    }

    /// Starts a private serial dispatcher for work that must be
    /// confined to one (non-main) thread. The caller owns it; dropping
    /// it shuts the thread down.
    pub fn new_serial_dispatcher(&self, name: impl Into<String>) -> Dispatcher {
        Dispatcher::start(name)
    }

    fn submit_on<T: Task>(&self, pool: &ThreadPool, task: T) -> TaskHandle<T> {
        let cell = Arc::new(TaskCell::new(task));
        let main = self.registry.main_handle();
        let handle = TaskHandle::new(Arc::clone(&cell), main.clone());
        pool.execute(move || task::run_background(&cell, &main));
        handle
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler() -> TaskScheduler {
        TaskScheduler::new(Arc::new(PoolRegistry::new()))
    }

    #[test]
    fn test_execute_runs_off_main() {
        let scheduler = scheduler();
        let (tx, rx) = crossbeam_channel::bounded(2);
        let probe = scheduler.clone();
        let tx2 = tx.clone();
        scheduler.execute(move || {
            let _ = tx.send(probe.is_main_thread());
        });
        scheduler.execute_io(move || {
            let _ = tx2.send(false);
        });
        for _ in 0..2 {
            assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
    }

    #[test]
    fn test_remove_main_callback_before_fire() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let token = scheduler.run_on_main_delayed(
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(50),
        );
        assert!(scheduler.remove_main_callback(token));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_is_main_thread_distinguishes_threads() {
        let scheduler = scheduler();
        assert!(!scheduler.is_main_thread());
        let (tx, rx) = crossbeam_channel::bounded(1);
        let probe = scheduler.clone();
        scheduler.run_on_main(move || {
            let _ = tx.send(probe.is_main_thread());
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_serial_dispatcher_is_not_main() {
        let scheduler = scheduler();
        let serial = scheduler.new_serial_dispatcher("test-serial");
        let handle = serial.handle();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let probe = scheduler.clone();
        handle.post(move || {
            let _ = tx.send(probe.is_main_thread());
        });
        assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
}
