//! # Engine Configuration
//!
//! Typed configuration for the routing engine. All values come from an
//! explicit TOML file plus `TICKETFLOW_*` environment overrides, with no
//! hardcoded fallbacks scattered through the code; validation rejects
//! nonsense instead of silently defaulting.

pub mod loader;

pub use loader::ConfigManager;

use crate::constants;
use crate::error::{EngineError, Result};
use crate::models::role::RoleRef;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Role whose members take ticket ownership, in `system:role` form.
    pub coordinator_role: String,
    #[serde(default)]
    pub submission: SubmissionConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// External submission client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Endpoint of the budget-management system.
    pub endpoint: String,
    pub timeout_seconds: u64,
    pub role_lookup_timeout_seconds: u64,
    pub initial_retry_delay_seconds: i64,
    pub backoff_base_seconds: i64,
    pub backoff_cap_seconds: i64,
    pub max_retries: u32,
}

/// Known-good substitute identifiers for the one-shot validation fallback.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FallbackConfig {
    pub fiscal_year_id: Option<String>,
    pub account_id: Option<String>,
}

/// Scheduling for the overdue-escalation and failed-submission sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_seconds: u64,
    pub batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coordinator_role: constants::DEFAULT_COORDINATOR_ROLE.to_string(),
            submission: SubmissionConfig::default(),
            fallback: FallbackConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_seconds: constants::DEFAULT_SUBMISSION_TIMEOUT_SECONDS,
            role_lookup_timeout_seconds: constants::DEFAULT_ROLE_LOOKUP_TIMEOUT_SECONDS,
            initial_retry_delay_seconds: constants::DEFAULT_INITIAL_RETRY_DELAY_SECONDS,
            backoff_base_seconds: constants::DEFAULT_BACKOFF_BASE_SECONDS,
            backoff_cap_seconds: constants::DEFAULT_BACKOFF_CAP_SECONDS,
            max_retries: constants::DEFAULT_MAX_RETRIES,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            batch_size: constants::DEFAULT_SWEEP_BATCH_SIZE,
        }
    }
}

impl EngineConfig {
    /// Parse and validate the coordinator role reference.
    pub fn coordinator_role(&self) -> Result<RoleRef> {
        RoleRef::parse(&self.coordinator_role)
    }

    /// Reject configurations that would corrupt deadlines or hang operations.
    pub fn validate(&self) -> Result<()> {
        self.coordinator_role()?;
        let s = &self.submission;
        if s.timeout_seconds == 0 || s.role_lookup_timeout_seconds == 0 {
            return Err(EngineError::Configuration {
                message: "submission and role-lookup timeouts must be positive".to_string(),
            });
        }
        if s.initial_retry_delay_seconds <= 0
            || s.backoff_base_seconds <= 0
            || s.backoff_cap_seconds < s.backoff_base_seconds
        {
            return Err(EngineError::Configuration {
                message: "retry delays must be positive and the cap at least the base".to_string(),
            });
        }
        if self.sweep.interval_seconds == 0 || self.sweep.batch_size == 0 {
            return Err(EngineError::Configuration {
                message: "sweep interval and batch size must be positive".to_string(),
            });
        }
        Ok(())
    }
}

impl SubmissionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn role_lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.role_lookup_timeout_seconds)
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}
