//! Utility module
//!
//! Process-level helpers for binaries and tests built on the library.

use crate::core::{Error, Result};

/// Installs a global `tracing` subscriber printing to stderr.
///
/// `level` is an `EnvFilter` directive such as `"info"` or
/// `"moteproto=debug"`; `RUST_LOG` takes precedence when set.
pub fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::config(format!("Invalid log filter '{}': {}", level, e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| Error::config(format!("Failed to init logging: {}", e)))
}
