use std::env;

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::errors::RelayError;

/// Installs the global subscriber. `LOG_LEVEL` (error, warn, info, debug) sets the base level;
/// `RUST_LOG` directives still apply on top of it.
pub fn init_logging() -> Result<(), RelayError> {
    let log_level = env::var("LOG_LEVEL")
        .map(|level| match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .map_err(|e| RelayError::Platform(format!("logging already initialized: {e}")))
}
