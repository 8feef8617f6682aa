//! Tracing subscriber initialization
//!
//! Installs a global `tracing-subscriber` registry with an `EnvFilter` and
//! either a human-readable or JSON formatter. Meant to be called once by the
//! shell embedding this layer; a second call fails with
//! [`TelemetryError::AlreadyInitialized`] and can be ignored.

use crate::config::LogConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "safespace_sync=info,warn";

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("Tracing subscriber already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Build the filter: config directive first, then `RUST_LOG`, then the default.
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter, TelemetryError> {
    match config.filter.as_deref().map(str::trim) {
        Some(filter) if !filter.is_empty() => {
            EnvFilter::try_new(filter).map_err(|e| TelemetryError::InvalidFilter {
                filter: filter.to_string(),
                reason: e.to_string(),
            })
        }
        _ => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

pub fn init_tracing(config: &LogConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    result.map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    tracing::debug!(json = config.json, "Tracing initialized");
    Ok(())
}
