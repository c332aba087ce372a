//! Cancellable one-shot tasks with main-thread callbacks.
//!
//! A [`Task`] has a background phase ([`Task::execute`]) that runs on a
//! pool thread and three callbacks that run on the main queue:
//! `on_success` and `on_failure` (mutually exclusive, at most one fires)
//! and `on_cancel` (fires at most once, only after a cancel request).
//!
//! # Cancellation semantics
//!
//! Cancellation is cooperative and best-effort. [`TaskHandle::cancel`]
//! sets the token's flag, wakes the captured worker thread, and posts
//! `on_cancel` to the main queue unconditionally — even if the task
//! never started or already finished. The success/failure callback is
//! gated by a final `is_cancelled` check performed **on the main
//! thread**, immediately before invocation, which closes the window
//! where a cancel races background completion: whichever side the main
//! thread observes first wins, and the completion callbacks never fire
//! after a cancel has been observed.
//!
//! A panic in the background phase is caught, logged, and redirected to
//! `on_failure`; it never takes the pool thread down.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error};

use crate::cancel::{CancelToken, Cancelled};
use crate::dispatch::DispatchHandle;

/// Why a background phase did not produce a value.
#[derive(Debug, Error)]
pub enum TaskFailure {
    /// The background phase observed cancellation and bailed out.
    #[error("task was cancelled")]
    Cancelled,
    /// The background phase panicked.
    #[error("background task panicked: {0}")]
    Panicked(String),
    /// The background phase failed with an application error.
    #[error("{0}")]
    Failed(String),
}

impl TaskFailure {
    /// Application failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// True for the cancellation variant.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<Cancelled> for TaskFailure {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// A unit of background work with main-thread completion callbacks.
///
/// The background phase receives the task's [`CancelToken`] and should
/// treat [`CancelToken::checkpoint`] / [`CancelToken::sleep`] errors as
/// its signal to stop; returning `Err(TaskFailure::Cancelled)` (or any
/// error while the token is cancelled) suppresses the failure callback.
pub trait Task: Send + Sync + 'static {
    /// Value produced by the background phase, handed to `on_success`.
    type Output: Send + 'static;

    /// Background phase; runs on a pool thread, never on the main thread.
    fn execute(&self, token: &CancelToken) -> Result<Self::Output, TaskFailure>;

    /// Success callback; runs on the main thread.
    fn on_success(&self, output: Self::Output);

    /// Failure callback; runs on the main thread.
    fn on_failure(&self, failure: TaskFailure) {
        let _ = failure;
    }

    /// Cancellation callback; runs on the main thread, at most once.
    fn on_cancel(&self) {}
}

pub(crate) struct TaskCell<T: Task> {
    pub(crate) task: T,
    pub(crate) token: CancelToken,
    /// Signalled when the background phase ends, whatever the outcome.
    /// Armed only by `submit_with_timeout`.
    done: Mutex<Option<Sender<()>>>,
}

impl<T: Task> TaskCell<T> {
    pub(crate) fn new(task: T) -> Self {
        Self {
            task,
            token: CancelToken::new(),
            done: Mutex::new(None),
        }
    }

    pub(crate) fn arm_done_latch(&self, tx: Sender<()>) {
        *self.done.lock() = Some(tx);
    }

    fn signal_done(&self) {
        if let Some(tx) = self.done.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// Handle to a submitted task.
///
/// Cloneable; all clones refer to the same task. Dropping the handle
/// does not cancel the task.
pub struct TaskHandle<T: Task> {
    cell: Arc<TaskCell<T>>,
    main: DispatchHandle,
}

impl<T: Task> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            main: self.main.clone(),
        }
    }
}

impl<T: Task> TaskHandle<T> {
    pub(crate) fn new(cell: Arc<TaskCell<T>>, main: DispatchHandle) -> Self {
        Self { cell, main }
    }

    /// Requests cancellation.
    ///
    /// Idempotent: only the first call takes effect. Sets the flag,
    /// sends a best-effort wake-up to the thread running the background
    /// phase, and posts `on_cancel` to the main queue unconditionally —
    /// callers must tolerate a cancellation callback arriving after the
    /// completion callbacks were suppressed, or for a task that never
    /// started at all.
    pub fn cancel(&self) {
        if self.cell.token.cancel() {
            debug!("task cancelled");
            let cell = Arc::clone(&self.cell);
            self.main.post(move || cell.task.on_cancel());
        }
    }

    /// True once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cell.token.is_cancelled()
    }
}

/// Runs the background phase on the current (pool) thread and posts the
/// completion callback to the main queue.
pub(crate) fn run_background<T: Task>(cell: &Arc<TaskCell<T>>, main: &DispatchHandle) {
    if cell.token.is_cancelled() {
        // Cancelled before start: on_cancel was already posted by the
        // cancel call; success/failure must never fire.
        debug!("task cancelled before background phase started");
        cell.signal_done();
        return;
    }
    cell.token.capture_thread();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| cell.task.execute(&cell.token)));
    cell.signal_done();
    let cell = Arc::clone(cell);
    match outcome {
        Ok(Ok(output)) => {
            main.post(move || {
                // Final gate, evaluated on the main thread.
                if !cell.token.is_cancelled() {
                    cell.task.on_success(output);
                }
            });
        }
        Ok(Err(failure)) => {
            main.post(move || {
                if !cell.token.is_cancelled() {
                    cell.task.on_failure(failure);
                }
            });
        }
        Err(payload) => {
            let message = crate::panic::message(&payload);
            error!(
                task = std::any::type_name::<T>(),
                panic = %message,
                "background phase panicked; redirecting to failure callback"
            );
            main.post(move || {
                if !cell.token.is_cancelled() {
                    cell.task.on_failure(TaskFailure::Panicked(message));
                }
            });
        }
    }
}

/// Adapter turning a closure pair into a [`Task`], for callers that do
/// not want a named task type.
pub struct ClosureTask<O, B, S>
where
    O: Send + 'static,
    B: Fn(&CancelToken) -> Result<O, TaskFailure> + Send + Sync + 'static,
    S: Fn(O) + Send + Sync + 'static,
{
    background: B,
    success: S,
}

impl<O, B, S> ClosureTask<O, B, S>
where
    O: Send + 'static,
    B: Fn(&CancelToken) -> Result<O, TaskFailure> + Send + Sync + 'static,
    S: Fn(O) + Send + Sync + 'static,
{
    pub fn new(background: B, success: S) -> Self {
        Self {
            background,
            success,
        }
    }
}

impl<O, B, S> Task for ClosureTask<O, B, S>
where
    O: Send + 'static,
    B: Fn(&CancelToken) -> Result<O, TaskFailure> + Send + Sync + 'static,
    S: Fn(O) + Send + Sync + 'static,
{
    type Output = O;

    fn execute(&self, token: &CancelToken) -> Result<O, TaskFailure> {
        (self.background)(token)
    }

    fn on_success(&self, output: O) {
        (self.success)(output);
    }
}
