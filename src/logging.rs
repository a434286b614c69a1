// src/logging.rs

use crate::rabbitmq::{QueueError, Result};
use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber. `RUST_LOG` wins over `default_level`; lapin's own
/// chatter is held at warn unless `RUST_LOG` says otherwise.
pub fn init(default_level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(default_level))
        .with_target(true)
        .try_init()
        .map_err(|e| QueueError::ConfigError(format!("Failed to install logger: {}", e)))
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},lapin=warn", default_level)))
}
