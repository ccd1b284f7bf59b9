//! Logging and observability
//!
//! Structured logging goes to stderr so stdout stays reserved for
//! machine-readable command output.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging system.
///
/// Honors `RUST_LOG`; defaults to `info` when unset. Call once per process,
/// before any other subsystem runs.
pub fn init() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    Ok(())
}
