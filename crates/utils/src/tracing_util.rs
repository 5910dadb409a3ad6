//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing with the default configuration: warnings and above
/// to stderr, overridable via `RUST_LOG`.
pub fn initialize_tracing() {
    let format = fmt::format().without_time().with_target(false).compact();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_filter(filter);
    tracing_subscriber::registry().with(layer).init();
}
