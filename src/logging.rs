//! Logging initialization for embedders and tests.
//!
//! The library itself only emits `tracing` events; it never installs a
//! subscriber on its own. Embedders that do not already run their own
//! subscriber can call [`init`] once at startup:
//! - Console output via the compact `fmt` layer
//! - Configurable via the RUST_LOG environment variable (default: info)

use tracing_subscriber::EnvFilter;

/// Installs a console `tracing` subscriber.
///
/// Filter defaults to `info` when RUST_LOG is unset. Safe to call more
/// than once (and alongside a test harness that installed its own
/// subscriber): losing the installation race is a no-op.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }
}
