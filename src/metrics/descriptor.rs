//! # Metric Descriptors
//!
//! A descriptor binds one notification name to a metric: how to pull the
//! measurement out, which tags to attach, and whether a given notification
//! should count at all. Descriptors are built once during setup and never
//! change afterwards.
//!
//! ```rust
//! use std::sync::Arc;
//! use tasker_job_metrics::events::{EventRegistry, Notification, NotificationName};
//! use tasker_job_metrics::metrics::{InMemorySink, MetricDescriptor, Tags};
//!
//! let registry = Arc::new(EventRegistry::new());
//! let sink = Arc::new(InMemorySink::new());
//! let event = NotificationName::new(["jobs", "queue", "depth"]);
//!
//! MetricDescriptor::last_value(["jobs", "queue_depth"], event.clone())
//!     .measurement_key("depth")
//!     .tags(["queue"])
//!     .attach(&registry, sink.clone())
//!     .unwrap();
//!
//! registry.publish(
//!     &Notification::bare(event)
//!         .with_measurement("depth", 4.0)
//!         .with_metadata(serde_json::json!({"queue": "default"})),
//! );
//!
//! let tags = Tags::from([("queue".to_string(), "default".to_string())]);
//! assert_eq!(sink.last_value("jobs.queue_depth", &tags), Some(4.0));
//! ```

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::sink::{MetricKind, MetricName, MetricsSink, Observation, Tags};
use crate::error::{MetricsError, Result};
use crate::events::notification::{Measurements, Notification, NotificationName};
use crate::events::registry::{handler, EventRegistry};
use crate::events::schema::{parse, InstanceScoped};
use crate::instances::InstanceFilterSet;
use crate::names::Identifier;

pub type MeasurementFn = Arc<dyn Fn(&Measurements, &Value) -> Option<f64> + Send + Sync>;
pub type TagFn = Arc<dyn Fn(&Value) -> Result<Tags> + Send + Sync>;
pub type KeepFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Declarative metric definition.
#[derive(Clone)]
pub struct MetricDescriptor {
    metric_name: MetricName,
    kind: MetricKind,
    source_event: NotificationName,
    description: Arc<str>,
    unit: Option<Arc<str>>,
    measurement: MeasurementFn,
    tags: Vec<String>,
    tag_values: TagFn,
    keep: KeepFn,
}

impl fmt::Debug for MetricDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricDescriptor")
            .field("metric_name", &self.metric_name.to_string())
            .field("kind", &self.kind)
            .field("source_event", &self.source_event.to_string())
            .field("description", &self.description)
            .field("unit", &self.unit)
            .field("tags", &self.tags)
            .finish()
    }
}

impl MetricDescriptor {
    /// Descriptor with defaults: the measurement is the one named after the
    /// last metric name segment, tags are read from top-level metadata and
    /// every notification is kept.
    pub fn new<I, S>(kind: MetricKind, metric_name: I, source_event: NotificationName) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let metric_name = MetricName::new(metric_name);
        let default_key = metric_name.last_segment().unwrap_or_default().to_string();

        Self {
            metric_name,
            kind,
            source_event,
            description: Arc::from(""),
            unit: None,
            measurement: Arc::new(move |measurements: &Measurements, _: &Value| {
                measurements.get(&default_key).copied()
            }),
            tags: Vec::new(),
            tag_values: Arc::new(top_level_tags),
            keep: Arc::new(|_: &Value| true),
        }
    }

    pub fn last_value<I, S>(metric_name: I, source_event: NotificationName) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(MetricKind::LastValue, metric_name, source_event)
    }

    pub fn counter<I, S>(metric_name: I, source_event: NotificationName) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(MetricKind::Counter, metric_name, source_event)
    }

    pub fn sum<I, S>(metric_name: I, source_event: NotificationName) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(MetricKind::Sum, metric_name, source_event)
    }

    pub fn distribution<I, S>(metric_name: I, source_event: NotificationName) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(MetricKind::Distribution, metric_name, source_event)
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Arc::from(description);
        self
    }

    pub fn unit(mut self, unit: &str) -> Self {
        self.unit = Some(Arc::from(unit));
        self
    }

    /// Read the measurement stored under `key`.
    pub fn measurement_key(mut self, key: &str) -> Self {
        let key = key.to_string();
        self.measurement = Arc::new(move |measurements: &Measurements, _: &Value| {
            measurements.get(&key).copied()
        });
        self
    }

    /// Read the measurement under `key` and scale it, e.g. nanoseconds to milliseconds.
    pub fn scaled_measurement(mut self, key: &str, factor: f64) -> Self {
        let key = key.to_string();
        self.measurement = Arc::new(move |measurements: &Measurements, _: &Value| {
            measurements.get(&key).map(|v| v * factor)
        });
        self
    }

    /// Ignore measurements and always report `value`; used for info metrics.
    pub fn constant(mut self, value: f64) -> Self {
        self.measurement = Arc::new(move |_: &Measurements, _: &Value| Some(value));
        self
    }

    pub fn measurement<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&Measurements, &Value) -> Option<f64> + Send + Sync + 'static,
    {
        self.measurement = Arc::new(extractor);
        self
    }

    /// Declared tag keys. Duplicates are dropped, first occurrence wins.
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        self.tags = tags
            .into_iter()
            .map(Into::<String>::into)
            .filter(|tag: &String| seen.insert(tag.clone()))
            .collect();
        self
    }

    pub fn tag_values<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&Value) -> Result<Tags> + Send + Sync + 'static,
    {
        self.tag_values = Arc::new(extractor);
        self
    }

    /// Derive tags from the family schema `T` instead of raw metadata.
    pub fn tag_values_from<T, F>(self, extractor: F) -> Self
    where
        T: InstanceScoped + 'static,
        F: Fn(&T) -> Tags + Send + Sync + 'static,
    {
        self.tag_values(move |metadata| parse::<T>(metadata).map(|typed| extractor(&typed)))
    }

    pub fn keep<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.keep = Arc::new(predicate);
        self
    }

    /// Keep only notifications whose schema `T` names an instance in `filter`.
    ///
    /// Metadata that does not match `T`, or names no instance, is rejected.
    pub fn keep_instances<T: InstanceScoped + 'static>(self, filter: InstanceFilterSet) -> Self {
        self.keep(move |metadata| {
            parse::<T>(metadata)
                .ok()
                .and_then(|typed| typed.instance().map(|id| filter.contains(id)))
                .unwrap_or(false)
        })
    }

    pub fn metric_name(&self) -> &MetricName {
        &self.metric_name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn source_event(&self) -> &NotificationName {
        &self.source_event
    }

    pub fn declared_tags(&self) -> &[String] {
        &self.tags
    }

    /// Subscription key used when attaching this descriptor.
    pub fn subscription_key(&self) -> String {
        format!("metric:{}@{}", self.metric_name, self.source_event)
    }

    /// Evaluate `notification` against this descriptor.
    ///
    /// `Ok(None)` means nothing is recorded: the keep predicate rejected the
    /// notification or the measurement is absent.
    pub fn evaluate(&self, notification: &Notification) -> Result<Option<Observation>> {
        if !(self.keep)(&notification.metadata) {
            return Ok(None);
        }

        let Some(value) = (self.measurement)(&notification.measurements, &notification.metadata)
        else {
            debug!(
                metric = %self.metric_name,
                event = %notification.name,
                "Measurement missing, skipping observation"
            );
            return Ok(None);
        };

        let mut extracted = (self.tag_values)(&notification.metadata)?;
        let mut tags = Tags::new();
        for key in &self.tags {
            match extracted.remove(key) {
                Some(value) => {
                    tags.insert(key.clone(), value);
                }
                None => {
                    return Err(MetricsError::Handler {
                        key: self.subscription_key(),
                        event: notification.name.to_string(),
                        reason: format!("missing tag '{key}'"),
                    })
                }
            }
        }

        Ok(Some(Observation {
            metric_name: self.metric_name.clone(),
            kind: self.kind,
            value,
            tags,
            description: self.description.clone(),
            unit: self.unit.clone(),
            recorded_at: Utc::now(),
        }))
    }

    /// Attach this descriptor to `registry`, recording into `sink`.
    pub fn attach(self, registry: &EventRegistry, sink: Arc<dyn MetricsSink>) -> Result<()> {
        let key = self.subscription_key();
        let event = self.source_event.clone();
        registry.attach(
            key,
            event,
            handler(move |notification| {
                if let Some(observation) = self.evaluate(notification)? {
                    sink.record(observation);
                }
                Ok(())
            }),
        )
    }
}

/// Attach every descriptor, stopping at the first registration error.
pub fn attach_all(
    registry: &EventRegistry,
    sink: Arc<dyn MetricsSink>,
    descriptors: impl IntoIterator<Item = MetricDescriptor>,
) -> Result<usize> {
    let mut attached = 0;
    for descriptor in descriptors {
        descriptor.attach(registry, sink.clone())?;
        attached += 1;
    }
    Ok(attached)
}

/// Default tag extraction: every top-level metadata entry rendered as a string.
fn top_level_tags(metadata: &Value) -> Result<Tags> {
    let Some(object) = metadata.as_object() else {
        return Ok(Tags::new());
    };
    Ok(object
        .iter()
        .filter_map(|(key, value)| tag_string(value).map(|v| (key.clone(), v)))
        .collect())
}

/// Render a metadata value as a tag value.
///
/// Identifiers are normalized; `null` has no tag value.
pub fn tag_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(_) => match serde_json::from_value::<Identifier>(value.clone()) {
            Ok(id) => Some(id.normalized()),
            Err(_) => Some(value.to_string()),
        },
        Value::Array(_) => Some(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::schema::QueueLengthMetadata;
    use crate::metrics::sink::InMemorySink;
    use serde_json::json;

    fn event() -> NotificationName {
        NotificationName::new(["tasker", "plugin", "jobs", "queue", "length", "count"])
    }

    fn notification(name: Value, queue: &str, count: f64) -> Notification {
        Notification::bare(event())
            .with_measurement("count", count)
            .with_metadata(json!({"name": name, "queue": queue, "state": "available"}))
    }

    fn queue_length(filter: InstanceFilterSet) -> MetricDescriptor {
        MetricDescriptor::last_value(["tasker", "jobs", "queue_length_count"], event())
            .measurement_key("count")
            .tags(["name", "queue", "state"])
            .tag_values_from::<QueueLengthMetadata, _>(|m| {
                Tags::from([
                    ("name".to_string(), m.name.normalized()),
                    ("queue".to_string(), m.queue.clone()),
                    ("state".to_string(), m.state.clone()),
                ])
            })
            .keep_instances::<QueueLengthMetadata>(filter)
    }

    #[test]
    fn test_kept_notification_produces_observation() {
        let descriptor = queue_length(InstanceFilterSet::default());
        let observation = descriptor
            .evaluate(&notification(json!({"module": "jobs::Jobs"}), "default", 3.0))
            .unwrap()
            .unwrap();

        assert_eq!(observation.value, 3.0);
        assert_eq!(observation.kind, MetricKind::LastValue);
        assert_eq!(observation.tags["name"], "Jobs");
        assert_eq!(observation.tags["queue"], "default");
        assert_eq!(observation.tags.len(), 3);
    }

    #[test]
    fn test_unmonitored_instance_is_rejected() {
        let descriptor = queue_length(InstanceFilterSet::default());
        let result = descriptor
            .evaluate(&notification(json!("Billing"), "default", 3.0))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_metadata_outside_schema_is_rejected() {
        let descriptor = queue_length(InstanceFilterSet::default());
        let n = Notification::bare(event())
            .with_measurement("count", 1.0)
            .with_metadata(json!({"queue": "default"}));
        assert!(descriptor.evaluate(&n).unwrap().is_none());
    }

    #[test]
    fn test_constant_measurement_ignores_payload() {
        let descriptor = MetricDescriptor::last_value(["info"], event()).constant(1.0);
        let observation = descriptor
            .evaluate(&Notification::bare(event()))
            .unwrap()
            .unwrap();
        assert_eq!(observation.value, 1.0);
        assert!(observation.tags.is_empty());
    }

    #[test]
    fn test_default_measurement_uses_last_segment() {
        let descriptor = MetricDescriptor::sum(["jobs", "count"], event());
        let observation = descriptor
            .evaluate(&Notification::bare(event()).with_measurement("count", 2.0))
            .unwrap()
            .unwrap();
        assert_eq!(observation.value, 2.0);
    }

    #[test]
    fn test_missing_measurement_records_nothing() {
        let descriptor = MetricDescriptor::last_value(["jobs", "limit"], event());
        assert!(descriptor
            .evaluate(&Notification::bare(event()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_missing_declared_tag_is_an_error() {
        let descriptor =
            MetricDescriptor::last_value(["jobs", "count"], event()).tags(["queue", "worker"]);
        let n = Notification::bare(event())
            .with_measurement("count", 1.0)
            .with_metadata(json!({"queue": "default"}));
        assert!(matches!(
            descriptor.evaluate(&n),
            Err(MetricsError::Handler { .. })
        ));
    }

    #[test]
    fn test_undeclared_tags_are_dropped_and_duplicates_collapse() {
        let descriptor =
            MetricDescriptor::last_value(["jobs", "count"], event()).tags(["queue", "queue"]);
        assert_eq!(descriptor.declared_tags(), ["queue".to_string()]);

        let n = Notification::bare(event())
            .with_measurement("count", 1.0)
            .with_metadata(json!({"queue": "default", "extra": 1}));
        let observation = descriptor.evaluate(&n).unwrap().unwrap();
        assert_eq!(observation.tags.keys().collect::<Vec<_>>(), vec!["queue"]);
    }

    #[test]
    fn test_attached_descriptor_records_into_sink() {
        let registry = EventRegistry::new();
        let sink = Arc::new(InMemorySink::new());
        queue_length(InstanceFilterSet::default())
            .attach(&registry, sink.clone())
            .unwrap();

        registry.publish(&notification(json!("Jobs"), "default", 3.0));
        registry.publish(&notification(json!("Jobs"), "default", 5.0));
        registry.publish(&notification(json!("Other"), "default", 9.0));

        let tags = Tags::from([
            ("name".to_string(), "Jobs".to_string()),
            ("queue".to_string(), "default".to_string()),
            ("state".to_string(), "available".to_string()),
        ]);
        assert_eq!(sink.last_value("tasker.jobs.queue_length_count", &tags), Some(5.0));
        assert_eq!(sink.observations_recorded(), 2);
    }

    #[test]
    fn test_tag_string_rendering() {
        assert_eq!(tag_string(&json!({"module": "jobs::Jobs"})), Some("Jobs".to_string()));
        assert_eq!(tag_string(&json!(3)), Some("3".to_string()));
        assert_eq!(tag_string(&json!(null)), None);
    }
}
