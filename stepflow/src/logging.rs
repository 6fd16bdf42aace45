//! Development-time tracing.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. Execution, validation,
//! and learning artifacts under `.stepflow/` are product output and are written
//! regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn`, or `stepflow=info` when `verbose` is set.
///
/// # Example
/// ```bash
/// RUST_LOG=stepflow=debug stepflow run --objective "Ship the release"
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "stepflow=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
