//! Worker thread pools for background execution.
//!
//! Two pool shapes are used by the registry:
//!
//! - **Parallel pool** ([`PoolConfig::parallel`]): CPU-scaled core/max
//!   sizing with a bounded work queue, intended for CPU-bound work.
//! - **Unbounded pool** ([`PoolConfig::unbounded`]): zero core threads,
//!   no thread cap, rendezvous hand-off, intended for blocking I/O and
//!   time-limited work. It also serves as the overflow target when the
//!   parallel pool's queue is full.
//!
//! Submission never errors back to the caller: a full bounded queue
//! first grows the pool toward its max, then redirects to the overflow
//! pool. A pool built without an overflow target runs the spillover job
//! inline on the submitting thread instead of dropping it.
//!
//! Worker threads demote themselves to background scheduling priority
//! before running user code, and idle workers above the core count
//! retire after the keep-alive interval.

mod worker;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, error};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fallback CPU count when detection fails.
pub const FALLBACK_CPU_COUNT: usize = 4;

/// Bounded work queue capacity for the parallel pool.
pub const PARALLEL_QUEUE_CAPACITY: usize = 256;

/// How long an idle worker above the core count lingers before retiring.
pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Returns the detected CPU count, falling back to [`FALLBACK_CPU_COUNT`].
pub fn cpu_count() -> usize {
    thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(FALLBACK_CPU_COUNT)
}

/// Core thread count for the parallel pool: `max(2, min(cpu + 1, 4))`.
pub fn parallel_core_threads() -> usize {
    cpu_count().saturating_add(1).min(4).max(2)
}

/// Maximum thread count for the parallel pool: `2 * core + 1`.
pub fn parallel_max_threads() -> usize {
    parallel_core_threads() * 2 + 1
}

/// Sizing and naming for a [`ThreadPool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Threads kept alive even when idle.
    pub core_threads: usize,
    /// Hard cap on concurrently live threads.
    pub max_threads: usize,
    /// Work queue capacity; zero means rendezvous hand-off.
    pub queue_capacity: usize,
    /// Idle retirement interval for threads above the core count.
    pub keep_alive: Duration,
    /// Prefix for worker thread names.
    pub name: String,
}

impl PoolConfig {
    /// CPU-scaled configuration for CPU-bound work.
    pub fn parallel(name: impl Into<String>) -> Self {
        Self {
            core_threads: parallel_core_threads(),
            max_threads: parallel_max_threads(),
            queue_capacity: PARALLEL_QUEUE_CAPACITY,
            keep_alive: KEEP_ALIVE,
            name: name.into(),
        }
    }

    /// Zero-core, uncapped configuration for blocking or time-limited
    /// work. Every submission either hands off to an idle worker or
    /// spawns a fresh one; idle workers retire after the keep-alive
    /// interval.
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self {
            core_threads: 0,
            max_threads: usize::MAX,
            queue_capacity: 0,
            keep_alive: KEEP_ALIVE,
            name: name.into(),
        }
    }
}

pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    /// Live worker count; grown by submissions, shrunk on retirement.
    pub(crate) live: AtomicUsize,
    next_worker_id: AtomicUsize,
}

impl PoolShared {
    /// Releases one worker slot if the pool is above its core count.
    /// Returns true if the calling worker should retire.
    pub(crate) fn try_retire(&self) -> bool {
        loop {
            let live = self.live.load(Ordering::Acquire);
            if live <= self.config.core_threads {
                return false;
            }
            if self
                .live
                .compare_exchange(live, live - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Releases one worker slot unconditionally (queue disconnected).
    pub(crate) fn release_slot(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

struct PoolInner {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    shared: Arc<PoolShared>,
    /// Redirect target when the queue is full and the pool is at max.
    overflow: Option<ThreadPool>,
}

/// A dynamically sized worker thread pool.
///
/// Cloning is cheap and shares the same pool. Workers observe queue
/// disconnection when the last clone is dropped and exit on their next
/// receive, so a dropped pool winds down without explicit teardown.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Creates a pool with no overflow target.
    ///
    /// Without an overflow target, a job submitted while the pool is
    /// saturated (queue full, max threads live) runs inline on the
    /// submitting thread.
    pub fn new(config: PoolConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a pool that redirects rejected work to `overflow`
    /// instead of dropping it or erroring back to the caller.
    pub fn with_overflow(config: PoolConfig, overflow: ThreadPool) -> Self {
        Self::build(config, Some(overflow))
    }

    fn build(config: PoolConfig, overflow: Option<ThreadPool>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(config.queue_capacity);
        debug!(
            name = %config.name,
            core = config.core_threads,
            max = config.max_threads,
            queue = config.queue_capacity,
            "thread pool created"
        );
        let shared = Arc::new(PoolShared {
            config,
            live: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(1),
        });
        Self {
            inner: Arc::new(PoolInner {
                tx,
                rx,
                shared,
                overflow,
            }),
        }
    }

    /// Number of currently live worker threads.
    pub fn live_workers(&self) -> usize {
        self.inner.shared.live.load(Ordering::Acquire)
    }

    /// Submits a unit of work. Never drops it and never errors.
    ///
    /// Returns without waiting for queue space. The one case where the
    /// call does not return promptly is a saturated pool with no
    /// overflow target, where the job runs inline on the calling
    /// thread.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.execute_boxed(Box::new(job));
    }

    pub(crate) fn execute_boxed(&self, job: Job) {
        let core = self.inner.shared.config.core_threads;
        // Grow to the core count before queueing at all.
        let job = match self.spawn_if(|live| live < core, job) {
            None => return,
            Some(job) => job,
        };
        let job = match self.inner.tx.try_send(job) {
            Ok(()) => return,
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => job,
        };
        // Queue full (or rendezvous with no idle worker): grow past core.
        let max = self.inner.shared.config.max_threads;
        let job = match self.spawn_if(|live| live < max, job) {
            None => return,
            Some(job) => job,
        };
        match &self.inner.overflow {
            Some(overflow) => {
                debug!(
                    name = %self.inner.shared.config.name,
                    "pool saturated; redirecting job to overflow pool"
                );
                overflow.execute_boxed(job);
            }
            None => {
                // No overflow target: run on the caller rather than drop.
                job();
            }
        }
    }

    /// Reserves a worker slot while `grow_while` holds, then spawns a
    /// worker seeded with `job`. Returns the job untouched if the
    /// predicate failed.
    fn spawn_if(&self, grow_while: impl Fn(usize) -> bool, job: Job) -> Option<Job> {
        let shared = &self.inner.shared;
        loop {
            let live = shared.live.load(Ordering::Acquire);
            if !grow_while(live) {
                return Some(job);
            }
            if shared
                .live
                .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.spawn_worker(job);
                return None;
            }
        }
    }

    fn spawn_worker(&self, initial: Job) {
        let shared = Arc::clone(&self.inner.shared);
        let rx = self.inner.rx.clone();
        let id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{} #{id}", shared.config.name);
        // The seed job is handed over on a dedicated channel; routing it
        // through the shared queue could block the submitter when the
        // queue is full.
        let (seed_tx, seed_rx) = crossbeam_channel::bounded::<Job>(1);
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker::run(shared, rx, seed_rx));
        match spawned {
            Ok(_) => {
                let _ = seed_tx.send(initial);
            }
            Err(e) => {
                self.inner.shared.release_slot();
                error!(worker = %name, error = %e, "failed to spawn pool worker; running job inline");
                initial();
            }
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.inner.shared.config.name)
            .field("live", &self.live_workers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_sizing_policy_bounds() {
        let core = parallel_core_threads();
        assert!((2..=4).contains(&core));
        assert_eq!(parallel_max_threads(), core * 2 + 1);
    }

    #[test]
    fn test_parallel_config_uses_policy() {
        let config = PoolConfig::parallel("test-pool");
        assert_eq!(config.core_threads, parallel_core_threads());
        assert_eq!(config.max_threads, parallel_max_threads());
        assert_eq!(config.queue_capacity, PARALLEL_QUEUE_CAPACITY);
        assert_eq!(config.keep_alive, KEEP_ALIVE);
    }

    #[test]
    fn test_unbounded_config_has_no_core_threads() {
        let config = PoolConfig::unbounded("io-pool");
        assert_eq!(config.core_threads, 0);
        assert_eq!(config.max_threads, usize::MAX);
        assert_eq!(config.queue_capacity, 0);
    }

    #[test]
    fn test_pool_runs_submitted_jobs() {
        let pool = ThreadPool::new(PoolConfig::parallel("test-run"));
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = crossbeam_channel::bounded(64);
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            });
        }
        for _ in 0..64 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_unbounded_pool_spawns_per_blocked_job() {
        let pool = ThreadPool::new(PoolConfig::unbounded("test-io"));
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let (done_tx, done_rx) = crossbeam_channel::bounded(8);
        // Eight jobs that all block until released must all be running
        // concurrently, so the pool must have grown to at least eight.
        for _ in 0..8 {
            let release_rx = release_rx.clone();
            let done_tx = done_tx.clone();
            pool.execute(move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
                let _ = done_tx.send(());
            });
        }
        // Wait for the workers to come up.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.live_workers() < 8 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(pool.live_workers() >= 8);
        for _ in 0..8 {
            let _ = release_tx.send(());
        }
        for _ in 0..8 {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = ThreadPool::new(PoolConfig::parallel("test-panic"));
        pool.execute(|| panic!("job exploded"));
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.execute(move || {
            let _ = tx.send(42);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_saturated_pool_without_overflow_runs_job_inline() {
        let config = PoolConfig {
            core_threads: 1,
            max_threads: 1,
            queue_capacity: 1,
            keep_alive: KEEP_ALIVE,
            name: "test-inline".into(),
        };
        let pool = ThreadPool::new(config);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        // Occupy the only worker and the only queue slot.
        for _ in 0..2 {
            let release_rx = release_rx.clone();
            pool.execute(move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
            });
        }
        let caller = thread::current().id();
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.execute(move || {
            let _ = tx.send(thread::current().id());
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), caller);
        for _ in 0..2 {
            let _ = release_tx.send(());
        }
    }

    #[test]
    fn test_overflow_redirect_when_saturated() {
        // A deliberately tiny pool: one thread, one queue slot, with an
        // unbounded overflow target. Saturate it and verify nothing is
        // lost.
        let overflow = ThreadPool::new(PoolConfig::unbounded("test-overflow"));
        let config = PoolConfig {
            core_threads: 1,
            max_threads: 1,
            queue_capacity: 1,
            keep_alive: KEEP_ALIVE,
            name: "test-tiny".into(),
        };
        let pool = ThreadPool::with_overflow(config, overflow);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let (done_tx, done_rx) = crossbeam_channel::bounded(16);
        for _ in 0..10 {
            let release_rx = release_rx.clone();
            let done_tx = done_tx.clone();
            pool.execute(move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
                let _ = done_tx.send(());
            });
        }
        for _ in 0..10 {
            let _ = release_tx.send(());
        }
        for _ in 0..10 {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }
}
