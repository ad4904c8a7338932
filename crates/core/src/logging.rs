//! Logging and observability
//!
//! This module provides structured logging and tracing utilities.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging system
///
/// Log output goes to stderr so that module output (tables, forwarded data)
/// on stdout stays machine-consumable. Verbosity is controlled with the
/// `LIMAR_LOG` environment variable, falling back to warnings only.
pub fn init() -> crate::errors::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_env("LIMAR_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init()
        .map_err(|e| crate::errors::LimarError::internal(format!("logging init failed: {e}")))?;

    Ok(())
}
