//! Logging setup
//!
//! The library only emits `tracing` events; binaries decide where they go.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Install a formatted subscriber filtered by `RUST_LOG`.
///
/// Returns `false` if a global subscriber was already installed, which makes
/// repeated calls (from tests or embedding applications) harmless.
pub fn init_logging() -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
