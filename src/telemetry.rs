//! Structured logging setup
use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Installs a global fmt subscriber. `RUST_LOG` wins over the configured
/// filter when set. Fails if a global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}
