//! # Notification Metadata Schemas
//!
//! One canonical metadata shape per notification family. Keep predicates and
//! tag extractors deserialize into these types instead of probing loose JSON
//! at each call site, so a payload either matches its family's schema or is
//! rejected in one place.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{MetricsError, Result};
use crate::names::Identifier;

/// Metadata types that belong to exactly one job-processing instance.
pub trait InstanceScoped: DeserializeOwned {
    /// Family name used in schema errors.
    const SCHEMA: &'static str;

    /// The instance this metadata was emitted by, if the payload names one.
    fn instance(&self) -> Option<&Identifier>;
}

/// Deserialize `metadata` into its family schema.
pub fn parse<T: InstanceScoped>(metadata: &Value) -> Result<T> {
    T::deserialize(metadata).map_err(|e| MetricsError::Schema {
        schema: T::SCHEMA.to_string(),
        reason: e.to_string(),
    })
}

/// Metadata of the compound `supervisor.init` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorInitMetadata {
    pub config: SupervisorConfig,
}

impl InstanceScoped for SupervisorInitMetadata {
    const SCHEMA: &'static str = "supervisor_init";

    fn instance(&self) -> Option<&Identifier> {
        Some(&self.config.name)
    }
}

/// The running configuration a supervisor reports when it starts.
///
/// Only `name` is required. Every other field falls back to its default when
/// absent or off-shape, so one odd field never hides the rest of the payload.
/// Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub name: Identifier,
    #[serde(default, deserialize_with = "lenient")]
    pub node: String,
    #[serde(default, deserialize_with = "lenient")]
    pub plugins: Vec<PluginSpec>,
    #[serde(default = "default_prefix", deserialize_with = "lenient_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub queues: QueueList,
    #[serde(default, deserialize_with = "lenient")]
    pub repo: Option<Identifier>,
    #[serde(default, deserialize_with = "lenient")]
    pub timezone: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub circuit_backoff: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub shutdown_grace_period: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub poll_interval: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub dispatch_cooldown: Option<f64>,
}

fn default_prefix() -> String {
    "public".to_string()
}

/// Deserialize `T`, falling back to its default when the value is off-shape.
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

fn lenient_prefix<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let prefix: Option<String> = lenient(deserializer)?;
    Ok(prefix.unwrap_or_else(default_prefix))
}

/// A plugin entry, either bare or paired with its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginSpec {
    WithOptions(Identifier, Value),
    Bare(Identifier),
}

impl PluginSpec {
    pub fn identifier(&self) -> &Identifier {
        match self {
            PluginSpec::WithOptions(id, _) | PluginSpec::Bare(id) => id,
        }
    }
}

/// Per-queue options; only the concurrency limit is read.
///
/// `["default", 10]` is shorthand for `["default", {"limit": 10}]`. A limit
/// that is not a non-negative integer reads as absent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct QueueOptions {
    pub limit: Option<u64>,
}

impl QueueOptions {
    fn from_value(value: &Value) -> Self {
        let limit = match value {
            Value::Object(opts) => opts.get("limit").and_then(Value::as_u64),
            other => other.as_u64(),
        };
        Self { limit }
    }
}

impl<'de> Deserialize<'de> for QueueOptions {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Self::from_value(&Value::deserialize(deserializer)?))
    }
}

/// Ordered `(queue, options)` pairs.
///
/// Accepts a list of `[name, options]` pairs (order kept) or an object keyed
/// by queue name (ordered by name). Entries are read one at a time: a list
/// entry without a string name is dropped, the others survive.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct QueueList(pub Vec<(String, QueueOptions)>);

impl QueueList {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, QueueOptions)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn from_value(value: &Value) -> Self {
        let queues = match value {
            Value::Array(entries) => entries.iter().filter_map(queue_entry).collect(),
            Value::Object(keyed) => keyed
                .iter()
                .map(|(name, opts)| (name.clone(), QueueOptions::from_value(opts)))
                .collect(),
            _ => Vec::new(),
        };
        QueueList(queues)
    }
}

fn queue_entry(entry: &Value) -> Option<(String, QueueOptions)> {
    match entry {
        Value::Array(pair) => {
            let name = pair.first()?.as_str()?;
            let opts = pair.get(1).map(QueueOptions::from_value).unwrap_or_default();
            Some((name.to_string(), opts))
        }
        Value::String(name) => Some((name.clone(), QueueOptions::default())),
        _ => None,
    }
}

impl<'de> Deserialize<'de> for QueueList {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Self::from_value(&Value::deserialize(deserializer)?))
    }
}

/// The slice of the init payload the queue limit proxy reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitQueuesMetadata {
    pub config: InitQueues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitQueues {
    pub name: Identifier,
    #[serde(default)]
    pub queues: QueueList,
}

impl InstanceScoped for InitQueuesMetadata {
    const SCHEMA: &'static str = "supervisor_init_queues";

    fn instance(&self) -> Option<&Identifier> {
        Some(&self.config.name)
    }
}

/// Metadata of the derived per-queue limit notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueLimitMetadata {
    pub name: Identifier,
    pub queue: String,
}

impl InstanceScoped for QueueLimitMetadata {
    const SCHEMA: &'static str = "queue_limit";

    fn instance(&self) -> Option<&Identifier> {
        Some(&self.name)
    }
}

/// Metadata of the synthetic queue length notification produced by polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueLengthMetadata {
    pub name: Identifier,
    pub queue: String,
    pub state: String,
}

impl InstanceScoped for QueueLengthMetadata {
    const SCHEMA: &'static str = "queue_length";

    fn instance(&self) -> Option<&Identifier> {
        Some(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfRef {
    pub name: Identifier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRef {
    pub queue: String,
    pub worker: Identifier,
    #[serde(default)]
    pub attempt: Option<u32>,
}

/// Metadata of `job.stop` and `job.exception` notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub conf: ConfRef,
    pub job: JobRef,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl InstanceScoped for JobMetadata {
    const SCHEMA: &'static str = "job";

    fn instance(&self) -> Option<&Identifier> {
        Some(&self.conf.name)
    }
}

/// Metadata of circuit breaker trip/open notifications.
///
/// `name` is the breaker, `conf` the owning instance when the emitter knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitMetadata {
    #[serde(default)]
    pub conf: Option<ConfRef>,
    pub name: Identifier,
}

impl InstanceScoped for CircuitMetadata {
    const SCHEMA: &'static str = "circuit";

    fn instance(&self) -> Option<&Identifier> {
        self.conf.as_ref().map(|conf| &conf.name)
    }
}
