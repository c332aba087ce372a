//! Pool worker thread loop.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{error, trace};

use super::{Job, PoolShared};

/// Worker entry point: demote priority, run the seed job, then drain
/// the shared queue until retirement or disconnection.
pub(super) fn run(shared: Arc<PoolShared>, rx: Receiver<Job>, seed: Receiver<Job>) {
    demote_priority();
    if let Ok(job) = seed.recv_timeout(shared.config.keep_alive) {
        run_job(&shared, job);
    }
    loop {
        match rx.recv_timeout(shared.config.keep_alive) {
            Ok(job) => run_job(&shared, job),
            Err(RecvTimeoutError::Timeout) => {
                if shared.try_retire() {
                    trace!(pool = %shared.config.name, "idle worker retiring");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                shared.release_slot();
                trace!(pool = %shared.config.name, "pool dropped, worker exiting");
                return;
            }
        }
    }
}

/// Runs one job, containing panics so a misbehaving job never takes the
/// worker thread down with it.
fn run_job(shared: &PoolShared, job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        error!(
            pool = %shared.config.name,
            panic = %crate::panic::message(&payload),
            "pool job panicked"
        );
    }
}

/// Demotes the current thread to background scheduling priority so bulk
/// background work does not starve the main thread at the OS level.
#[cfg(unix)]
fn demote_priority() {
    // Raising nice by 10 mirrors the platform convention for background
    // workers. Per-thread nice values are honored on Linux.
    let result = unsafe { libc::nice(10) };
    trace!(nice = result, "worker thread demoted to background priority");
}

#[cfg(not(unix))]
fn demote_priority() {}
