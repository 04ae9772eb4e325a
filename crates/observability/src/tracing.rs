//! Tracing subscriber configuration.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber: JSON lines, level set by `RUST_LOG`
/// (default `info`).
///
/// Uses `try_init` so tests that each call [`crate::init`] do not panic
/// on the second registration.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_target(false)
        .try_init();
}
