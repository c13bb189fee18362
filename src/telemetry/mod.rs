//! Diagnostic logging setup
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, else logging.level)
//!   └── Fmt Layer (console output, JSON when logging.json)
//! ```
//!
//! Transaction records themselves are not routed here unless the `log`
//! reporter is selected; this is the engine's own diagnostics.

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Errors raised while installing the subscriber
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{0}': {1}")]
    InvalidFilter(String, String),

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    AlreadyInitialized(String),
}

/// Build the filter: `RUST_LOG` when set, otherwise the configured level
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| TelemetryError::InvalidFilter(config.level.clone(), e.to_string())),
    }
}

/// Install the global subscriber
pub fn init_subscriber(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let env_filter = env_filter(config)?;

    let result = if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);

        tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(env_filter).with(fmt_layer),
        )
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true);

        tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(env_filter).with(fmt_layer),
        )
    };

    result.map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))
}
