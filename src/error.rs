//! Error types for the job metrics pipeline.
//!
//! Setup errors (configuration, registration) are fatal and returned before
//! anything is attached. Handler and store errors are isolated at the point
//! they occur and only surface through logs and dispatch/collection reports.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricsError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfiguration { field: String, reason: String },
    #[error("Registration error: {0}")]
    Registration(String),
    #[error("Handler '{key}' failed on event '{event}': {reason}")]
    Handler {
        key: String,
        event: String,
        reason: String,
    },
    #[error("Handler '{key}' panicked on event '{event}'")]
    HandlerPanicked { key: String, event: String },
    #[error("Metadata does not match schema '{schema}': {reason}")]
    Schema { schema: String, reason: String },
    #[error("Store error for instance '{instance}': {reason}")]
    Store { instance: String, reason: String },
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl MetricsError {
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        MetricsError::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that must abort setup rather than be logged and skipped.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            MetricsError::Configuration(_)
                | MetricsError::InvalidConfiguration { .. }
                | MetricsError::Registration(_)
        )
    }
}

impl From<::config::ConfigError> for MetricsError {
    fn from(err: ::config::ConfigError) -> Self {
        MetricsError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for MetricsError {
    fn from(err: serde_json::Error) -> Self {
        MetricsError::Schema {
            schema: "json".to_string(),
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MetricsError>;
