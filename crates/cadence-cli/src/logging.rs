//! Diagnostic tracing for the cadence CLI.
//!
//! Results and events go to stdout as JSON; tracing output goes to stderr
//! and never mixes with them.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn` if unset. `verbose` raises the
/// default to `debug` for the engine.
///
/// # Example
/// ```bash
/// RUST_LOG=cadence_engine=debug cadence apply shop /sprint start
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "warn,cadence_engine=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
