//! Tracing setup.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// The filter comes from `KVSCHED_LOG` (falling back to `info`). Safe to
/// call more than once; later calls are no-ops.
pub fn init() {
    init_with_filter(None);
}

/// Initialize with an explicit filter directive, overriding the
/// environment.
pub fn init_with_filter(filter: Option<&str>) {
    let env_filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_env("KVSCHED_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
