//! Tracing subscriber installation.
//!
//! Every entry point is idempotent: the first subscriber installed wins and
//! later calls are no-ops.

use tracing_subscriber::EnvFilter;

/// Default directive when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// JSON logs filtered by `RUST_LOG`, defaulting to `info`.
pub fn init() {
    init_with_default(DEFAULT_FILTER);
}

/// JSON logs filtered by `RUST_LOG`, or by `default` (e.g.
/// `"warden_infra=debug,info"`) when the variable is unset.
pub fn init_with_default(default: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .try_init();
}

/// Human-readable logs routed through the test harness's capture.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("warden_infra=debug,warn"))
        .with_test_writer()
        .try_init();
}
