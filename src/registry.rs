//! Process-wide executor registry.
//!
//! One [`PoolRegistry`] owns every execution resource the scheduler
//! hands work to:
//!
//! - the **parallel pool**, CPU-scaled and bounded, for CPU-bound work;
//! - the **timeout pool**, zero-core and uncapped, for blocking I/O and
//!   deadline-monitored work, doubling as the parallel pool's overflow
//!   target;
//! - the **main dispatcher**, the single ordered callback thread.
//!
//! The registry is typically wrapped in an `Arc` and shared through
//! [`TaskScheduler`](crate::scheduler::TaskScheduler); constructing more
//! than one is supported (useful in tests) but each carries its own
//! threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::dispatch::{DispatchHandle, Dispatcher};
use crate::periodic::{self, PeriodicTask};
use crate::pool::{PoolConfig, ThreadPool};

const PARALLEL_POOL_NAME: &str = "threadline-parallel";
const TIMEOUT_POOL_NAME: &str = "threadline-timeout";
const MAIN_QUEUE_NAME: &str = "threadline-main";

/// Owns the worker pools and the main dispatch queue.
pub struct PoolRegistry {
    parallel: ThreadPool,
    timeout: ThreadPool,
    dispatcher: Dispatcher,
    timer_seq: AtomicU64,
}

impl PoolRegistry {
    /// Brings up the pools and the main dispatcher thread.
    pub fn new() -> Self {
        let timeout = ThreadPool::new(PoolConfig::unbounded(TIMEOUT_POOL_NAME));
        let parallel =
            ThreadPool::with_overflow(PoolConfig::parallel(PARALLEL_POOL_NAME), timeout.clone());
        let dispatcher = Dispatcher::start(MAIN_QUEUE_NAME);
        info!("executor registry started");
        Self {
            parallel,
            timeout,
            dispatcher,
            timer_seq: AtomicU64::new(1),
        }
    }

    /// The CPU-scaled pool for CPU-bound work.
    pub fn parallel(&self) -> &ThreadPool {
        &self.parallel
    }

    /// The uncapped pool for blocking I/O and deadline-monitored work.
    pub fn timeout(&self) -> &ThreadPool {
        &self.timeout
    }

    /// Handle posting to the main queue.
    pub fn main_handle(&self) -> DispatchHandle {
        self.dispatcher.handle()
    }

    /// Barrier-exempt handle to the main queue.
    pub fn async_main_handle(&self) -> DispatchHandle {
        self.dispatcher.async_handle()
    }

    /// Activates a periodic task: clears any previous stop request and
    /// spawns its dedicated timer thread.
    pub fn start_periodic(&self, task: &Arc<PeriodicTask>) {
        task.rearm();
        let id = self.timer_seq.fetch_add(1, Ordering::Relaxed);
        debug!(timer = id, period = ?task.period(), "activating periodic task");
        periodic::spawn_timer(Arc::clone(task), self.main_handle(), id);
    }

    /// Shuts down the main dispatcher, discarding undelivered callbacks.
    ///
    /// Pool workers wind down on their own once the registry is dropped
    /// and their queues disconnect.
    pub fn shutdown(&self) {
        info!("executor registry shutting down");
        self.dispatcher.shutdown();
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("parallel", &self.parallel)
            .field("timeout", &self.timeout)
            .finish()
    }
}
