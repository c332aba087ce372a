//! Fixed-rate periodic tasks.
//!
//! A [`PeriodicTask`] ticks at a fixed rate: tick N targets
//! `schedule time + initial delay + (N - 1) × period`, computed from the
//! original schedule, never from the previous tick's completion. A tick
//! that overruns its period therefore causes the following ticks to
//! fire back-to-back until the schedule catches up — the standard
//! fixed-rate tradeoff, kept deliberately (this is not fixed-delay
//! scheduling).
//!
//! Each activation owns a dedicated timer thread, so stopping one
//! periodic task can never disturb another. The stop flag is checked at
//! every tick boundary: stopping during tick K prevents tick K+1 and
//! shuts the timer thread down, but does not undo tick K.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::dispatch::DispatchHandle;

/// Which thread runs each tick.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TickTarget {
    /// Ticks are forwarded to the main queue.
    #[default]
    Main,
    /// Ticks run inline on the timer thread.
    Background,
}

/// A repeating unit of work with a period, an initial delay, and a
/// target thread.
///
/// Construct with [`PeriodicTask::new`] and the builder methods, wrap
/// in an [`Arc`], and hand to
/// [`TaskScheduler::schedule`](crate::scheduler::TaskScheduler::schedule).
/// The same instance can be stopped and re-scheduled; re-scheduling
/// clears the stop flag first.
pub struct PeriodicTask {
    period: Duration,
    initial_delay: Duration,
    target: TickTarget,
    cancelled: AtomicBool,
    tick: Box<dyn Fn() + Send + Sync>,
}

impl PeriodicTask {
    /// A main-thread periodic task with no initial delay.
    pub fn new(period: Duration, tick: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            period,
            initial_delay: Duration::ZERO,
            target: TickTarget::default(),
            cancelled: AtomicBool::new(false),
            tick: Box::new(tick),
        }
    }

    /// Sets the thread each tick runs on.
    pub fn with_target(mut self, target: TickTarget) -> Self {
        self.target = target;
        self
    }

    /// Sets the delay before the first tick.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// The configured period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// The configured initial delay.
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// The configured tick target.
    pub fn target(&self) -> TickTarget {
        self.target
    }

    /// Requests that ticking stop.
    ///
    /// The dedicated timer observes the flag no later than the next
    /// tick boundary and shuts down. A tick already forwarded to the
    /// main queue re-checks the flag before running, so a stop during
    /// tick K also suppresses a K+1 that was already in flight.
    /// Returns true if this call performed the transition.
    pub fn stop(&self) -> bool {
        self.cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True once [`stop`](Self::stop) has been called (and not yet
    /// cleared by a re-schedule).
    pub fn is_stopped(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Clears the stop flag for idempotent reuse.
    pub(crate) fn rearm(&self) {
        let _ = self
            .cancelled
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Runs one tick unless stopped.
    pub(crate) fn run_tick(&self) {
        if !self.is_stopped() {
            (self.tick)();
        }
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("period", &self.period)
            .field("initial_delay", &self.initial_delay)
            .field("target", &self.target)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Spawns the dedicated timer thread for one activation.
///
/// Caveat inherited from the original design: if the task is stopped
/// and re-scheduled within a single period, the previous timer may not
/// yet have observed the (now cleared) flag and will keep ticking
/// alongside the new one. Callers re-scheduling should do so after the
/// prior timer has had a tick boundary to shut down on.
pub(crate) fn spawn_timer(task: Arc<PeriodicTask>, main: DispatchHandle, timer_id: u64) {
    let name = format!("threadline-timer #{timer_id}");
    let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        let first = Instant::now() + task.initial_delay;
        let mut tick: u32 = 0;
        loop {
            let target = first + task.period * tick;
            loop {
                let now = Instant::now();
                if now >= target {
                    break;
                }
                thread::park_timeout(target - now);
            }
            if task.is_stopped() {
                debug!(timer = timer_id, ticks = tick, "periodic timer shutting down");
                return;
            }
            match task.target {
                TickTarget::Background => task.run_tick(),
                TickTarget::Main => {
                    let task = Arc::clone(&task);
                    main.post(move || task.run_tick());
                }
            }
            tick += 1;
        }
    });
    if let Err(e) = spawned {
        error!(timer = %name, error = %e, "failed to spawn periodic timer thread");
    }
}
