//! # Structured Logging Module
//!
//! Environment-aware structured logging for debugging routing and
//! submission flows. Output format and level are driven by environment
//! variables so embedders can reconfigure without code changes.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; only the first call has any effect. If a
/// global subscriber is already installed (for example by a test harness),
/// this is a no-op rather than a panic.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_env("TICKETFLOW_LOG")
            .unwrap_or_else(|_| EnvFilter::new(default_log_level(&environment)));

        let json_output = std::env::var("TICKETFLOW_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let registry = tracing_subscriber::registry().with(filter);
        let result = if json_output {
            registry
                .with(fmt::layer().with_target(true).with_ansi(false).json())
                .try_init()
        } else {
            registry.with(fmt::layer().with_target(true)).try_init()
        };

        if result.is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        } else {
            tracing::info!(environment = %environment, "structured logging initialized");
        }
    });
}

fn get_environment() -> String {
    std::env::var("TICKETFLOW_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn default_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}
