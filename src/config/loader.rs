//! Configuration loading: TOML file + environment overrides, validated once
//! at startup.

use super::EngineConfig;
use crate::error::{EngineError, Result};
use config::{Config, Environment, File};
use std::path::Path;
use tracing::info;

/// Loads and holds the validated engine configuration.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: EngineConfig,
}

impl ConfigManager {
    /// Load from `config/ticketflow.toml` (optional) with `TICKETFLOW_*`
    /// environment overrides, e.g. `TICKETFLOW_SUBMISSION__TIMEOUT_SECONDS`.
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/ticketflow.toml")
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let builder = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("TICKETFLOW").separator("__"));

        let config: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EngineError::Configuration {
                message: format!("failed to load configuration: {e}"),
            })?;

        config.validate()?;
        info!(
            coordinator_role = %config.coordinator_role,
            submission_timeout_s = config.submission.timeout_seconds,
            max_retries = config.submission.max_retries,
            "engine configuration loaded"
        );
        Ok(Self { config })
    }

    /// Wrap an already-constructed configuration (tests, embedders).
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
