//! Tracing initialization

use tracing_subscriber::EnvFilter;

use crate::{config::EngineConfig, error::Result};

/// Initialize JSON-formatted tracing for the engine
///
/// Safe to call once per process; subsequent calls return an error from the
/// global subscriber, which callers may ignore in tests.
pub fn init_tracing(config: &EngineConfig) -> Result<()> {
    let log_level = config.service.log_level.clone();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Tracing initialized for service: {}", config.service.name);

    Ok(())
}
