//! Log subscriber setup for the binary.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! application's job.

use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG`, or `psu_bench=<level>` when unset.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("psu_bench={}", level)))
}

/// Install a formatted subscriber. Later calls are no-ops.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_target(false)
        .try_init();
}
