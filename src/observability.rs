// src/observability.rs
//! Logging setup
//!
//! Counters are emitted through the `metrics` facade; installing a recorder
//! is left to the embedding process.

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{EngineError, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber.
///
/// Filter precedence: `RUST_LOG`, then `verbose` (`-v` info, `-vv` debug,
/// `-vvv` trace), then `logging.filter`. Output goes to stderr.
pub fn init_tracing(config: &LoggingConfig, verbose: u8) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match verbose {
            0 => EnvFilter::try_new(&config.filter).map_err(|e| {
                EngineError::ObservabilityFailed(format!(
                    "invalid log filter '{}': {}",
                    config.filter, e
                ))
            })?,
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        },
    };

    let (plain, json) = if config.json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr)), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .try_init()
        .map_err(|e| EngineError::ObservabilityFailed(e.to_string()))
}
