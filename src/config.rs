//! # Configuration
//!
//! Layered configuration for the metrics pipeline, resolved in order:
//!
//! 1. Built-in defaults
//! 2. An optional file (`config/job-metrics.toml` unless a path is given)
//! 3. Environment variables prefixed `TASKER_METRICS__`, e.g.
//!    `TASKER_METRICS__POLL_INTERVAL_MS=10000`
//!
//! The instance filter must be a list. A scalar is rejected with a
//! descriptive error instead of being coerced into a one-element list.

use config::{Config, ConfigBuilder, Environment, File, FileFormat, ValueKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{MetricsError, Result};
use crate::instances::{InstanceFilterSet, DEFAULT_INSTANCE};
use crate::names::Identifier;

/// File consulted when no explicit path is given. Missing is fine.
pub const DEFAULT_CONFIG_PATH: &str = "config/job-metrics.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "TASKER_METRICS";

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Instances metrics are collected for.
    pub instances: Vec<Identifier>,
    /// Period of the queue length poll.
    pub poll_interval_ms: u64,
    /// Leading segments of every metric name.
    pub metric_prefix: Vec<String>,
    /// `production` switches log output to JSON.
    pub environment: String,
    /// Log filter used when `RUST_LOG` is unset, e.g. `info` or
    /// `warn,tasker_job_metrics=debug`.
    pub log_level: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            instances: vec![Identifier::plain(DEFAULT_INSTANCE)],
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            metric_prefix: default_metric_prefix(),
            environment: "development".to_string(),
            log_level: "info".to_string(),
        }
    }
}

fn default_metric_prefix() -> Vec<String> {
    vec!["tasker".to_string(), "jobs".to_string()]
}

impl MetricsConfig {
    /// Defaults, then [`DEFAULT_CONFIG_PATH`] if present, then environment.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load with an explicit file. An explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_PATH).required(false),
        };

        let builder = defaults()?.add_source(file).add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("instances")
                .with_list_parse_key("metric_prefix")
                .try_parsing(true),
        );

        Self::build(builder)
    }

    /// Load from an in-memory document, layered over the defaults.
    pub fn from_document(contents: &str, format: FileFormat) -> Result<Self> {
        Self::build(defaults()?.add_source(File::from_str(contents, format)))
    }

    /// Build from a JSON value, e.g. options handed over by an embedding host.
    pub fn from_json(value: &Value) -> Result<Self> {
        if let Some(instances) = value.get("instances") {
            if !instances.is_array() {
                return Err(non_list_instances(&instances.to_string()));
            }
        }
        Self::from_document(&value.to_string(), FileFormat::Json)
    }

    fn build(builder: ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let raw = builder.build()?;

        let instances = raw.get::<config::Value>("instances")?;
        if !matches!(instances.kind, ValueKind::Array(_)) {
            return Err(non_list_instances(&instances.to_string()));
        }

        let config: MetricsConfig = raw.try_deserialize()?;
        config.validate()?;

        debug!(
            instances = config.instances.len(),
            poll_interval_ms = config.poll_interval_ms,
            metric_prefix = %config.metric_prefix.join("."),
            environment = %config.environment,
            "Metrics configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(MetricsError::invalid_config(
                "poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.metric_prefix.is_empty() {
            return Err(MetricsError::invalid_config(
                "metric_prefix",
                "must contain at least one segment",
            ));
        }
        if self.metric_prefix.iter().any(|segment| segment.trim().is_empty()) {
            return Err(MetricsError::invalid_config(
                "metric_prefix",
                "segments must not be blank",
            ));
        }
        if self.instances.is_empty() {
            warn!("No instances configured, no job metrics will be recorded");
        }
        Ok(())
    }

    pub fn instance_filter(&self) -> InstanceFilterSet {
        InstanceFilterSet::new(self.instances.iter().cloned())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn defaults() -> Result<ConfigBuilder<config::builder::DefaultState>> {
    let fallback = MetricsConfig::default();
    Ok(Config::builder()
        .set_default("instances", vec![DEFAULT_INSTANCE])?
        .set_default("poll_interval_ms", fallback.poll_interval_ms)?
        .set_default("metric_prefix", fallback.metric_prefix)?
        .set_default("environment", fallback.environment)?
        .set_default("log_level", fallback.log_level)?)
}

fn non_list_instances(found: &str) -> MetricsError {
    MetricsError::invalid_config(
        "instances",
        format!("expected a list of instance names, got {found}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tokio_test::assert_ok;

    #[test]
    fn test_defaults() {
        let config = MetricsConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.metric_prefix, vec!["tasker", "jobs"]);
        assert!(config.instance_filter().contains_name("Jobs"));
        assert_ok!(config.validate());
    }

    #[test]
    fn test_document_overrides_defaults() {
        let config = MetricsConfig::from_document(
            r#"{"instances": ["Jobs", {"module": "jobs::Billing"}], "poll_interval_ms": 250}"#,
            FileFormat::Json,
        )
        .unwrap();

        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.metric_prefix, vec!["tasker", "jobs"]);
        let filter = config.instance_filter();
        assert!(filter.contains_name("Jobs"));
        assert!(filter.contains_name("Billing"));
    }

    #[test]
    fn test_logging_settings_load_from_document() {
        let config = MetricsConfig::from_document(
            r#"{"environment": "production", "log_level": "warn"}"#,
            FileFormat::Json,
        )
        .unwrap();
        assert_eq!(config.environment, "production");
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_scalar_instances_rejected() {
        let err = MetricsConfig::from_document(r#"{"instances": "Jobs"}"#, FileFormat::Json)
            .unwrap_err();
        match err {
            MetricsError::InvalidConfiguration { field, reason } => {
                assert_eq!(field, "instances");
                assert!(reason.contains("list"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_json_options_reject_scalar_instances() {
        let err = MetricsConfig::from_json(&json!({"instances": "Jobs"})).unwrap_err();
        assert!(err.is_setup_error());

        let config = MetricsConfig::from_json(&json!({"instances": ["Jobs"]})).unwrap();
        assert_eq!(config.instances, vec![Identifier::plain("Jobs")]);
    }

    #[test]
    fn test_zero_interval_and_empty_prefix_rejected() {
        let zero = MetricsConfig::from_document(r#"{"poll_interval_ms": 0}"#, FileFormat::Json);
        assert!(zero.is_err());

        let config = MetricsConfig {
            metric_prefix: vec![],
            ..MetricsConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MetricsError::InvalidConfiguration { ref field, .. }) if field == "metric_prefix"
        ));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"instances = ["Jobs", "Reports"]
poll_interval_ms = 1000
metric_prefix = ["acme", "jobs"]"#
        )
        .unwrap();

        let config = MetricsConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.metric_prefix, vec!["acme", "jobs"]);
        assert_eq!(config.instance_filter().len(), 2);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let err = MetricsConfig::load(Some(&missing)).unwrap_err();
        assert!(matches!(err, MetricsError::Configuration(_)));
    }
}
