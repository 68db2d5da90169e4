use tracing_subscriber::{EnvFilter, fmt};

/// Tracing target used for alert lines, so they can be filtered or routed
/// separately (`RUST_LOG=alerts=info`).
pub const ALERT_TARGET: &str = "alerts";

/// Initialise the global tracing subscriber.
///
/// Respects `RUST_LOG` env var; defaults to `info` level.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();
}
