//! Tracing setup for the transport crates.

use tracing_subscriber::EnvFilter;

/// Keeps the weft crates at `level` and everything else at warn, unless
/// `RUST_LOG` overrides the whole filter.
fn weft_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,weft_core={level},weft_transport={level}"))
    })
}

/// Human-readable output for interactive runs. Scheduler decisions and
/// ledger transitions land on debug.
pub fn init_dev_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(weft_filter("debug"))
        .with_target(false)
        .init();
}

/// JSON output for deployments feeding a log collector.
pub fn init_prod_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(weft_filter("info"))
        .with_target(true)
        .json()
        .init();
}

/// Explicit directives, e.g. `weft_transport::scheduler=trace`.
pub fn init_logging_with_filter(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();
}
