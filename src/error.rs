//! Error types for the scheduler facade.

use thiserror::Error;

/// Errors surfaced immediately at the call site.
///
/// These are configuration errors: the caller asked for something the
/// current state of the world cannot honor, and deferring the failure
/// would only hide the bug. Background-task failures are not represented
/// here; they travel through [`crate::task::TaskFailure`] to the failure
/// callback instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A lifecycle-bound dispatch was requested against a lifecycle that
    /// has already emitted its destroy event.
    #[error("lifecycle has already been destroyed; cannot bind new work to it")]
    LifecycleDestroyed,
}
