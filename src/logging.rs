//! Diagnostic tracing.
//!
//! Loop output shown to the user goes through orchestrator updates; this is
//! only for debugging the orchestrator itself.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Writes compact lines to stderr.
///
/// # Example
/// ```bash
/// RUST_LOG=loopherd=debug loopherd alpha beta
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
