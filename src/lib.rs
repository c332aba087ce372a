//! Threadline - lifecycle-aware task scheduling on plain threads
//!
//! This library provides a small set of cooperating executors for
//! applications with a designated main thread: a CPU-scaled worker
//! pool, an uncapped pool for blocking I/O, an ordered main dispatch
//! queue with delays and removable entries, fixed-rate periodic tasks,
//! lifecycle-bound callbacks, and a consume-once observable value.
//!
//! # High-Level API
//!
//! For most use cases, the [`scheduler`] module provides a facade over
//! an injected [`registry::PoolRegistry`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use threadline::registry::PoolRegistry;
//! use threadline::scheduler::TaskScheduler;
//!
//! let scheduler = TaskScheduler::new(Arc::new(PoolRegistry::new()));
//!
//! scheduler.execute(|| {
//!     // CPU-bound work on the parallel pool
//! });
//! scheduler.run_on_main(|| {
//!     // callback on the main queue
//! });
//! ```
//!
//! Cancellable work implements [`task::Task`]; its background phase
//! receives a [`cancel::CancelToken`] and its completion callbacks run
//! on the main queue.

pub mod cancel;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod observable;
mod panic;
pub mod periodic;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod task;

/// Version of the threadline library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
