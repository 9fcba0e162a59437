//! # Structured Logging Module
//!
//! Environment-aware structured logging for the metrics pipeline. Console
//! output is human-readable in development and test, JSON in production.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::MetricsConfig;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// The environment comes from `TASKER_ENV` or `APP_ENV`. `RUST_LOG` wins over
/// the environment's default level. Safe to call more than once, and a no-op
/// when the host already installed a subscriber.
pub fn init_structured_logging() {
    install(&get_environment(), None);
}

/// Initialize structured logging from a loaded [`MetricsConfig`].
///
/// `config.environment` picks the output format and `config.log_level` is
/// the filter used when `RUST_LOG` is unset.
pub fn init_structured_logging_with(config: &MetricsConfig) {
    install(&config.environment, Some(&config.log_level));
}

fn install(environment: &str, log_level: Option<&str>) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let directive = default_directive(environment, log_level);
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));

        let layer = if uses_json_output(environment) {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized, keeping it");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            default_filter = %directive,
            "Structured logging initialized"
        );
    });
}

/// Filter used when `RUST_LOG` is unset: the configured level, else the
/// environment's default.
fn default_directive(environment: &str, log_level: Option<&str>) -> String {
    log_level
        .map(str::trim)
        .filter(|level| !level.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| get_log_level(environment))
}

fn uses_json_output(environment: &str) -> bool {
    environment == "production"
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("TASKER_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "test" => "debug".to_string(),
        "development" => "debug".to_string(),
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log a pipeline lifecycle step (setup, start, shutdown) with its component.
pub fn log_pipeline_operation(
    operation: &str,
    component: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        component = %component,
        status = %status,
        details = details,
        "PIPELINE_OPERATION"
    );
}
