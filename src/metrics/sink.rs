//! # Metrics Sinks
//!
//! The boundary between the pipeline and whatever stores or exposes metrics.
//! Descriptors hand every extracted measurement to a [`MetricsSink`] as an
//! [`Observation`]; the sink decides how the metric kind aggregates.
//!
//! Two implementations ship with the crate:
//! - [`InMemorySink`]: aggregates in process, used by tests and embedders that
//!   scrape values themselves
//! - [`OtelSink`]: forwards to OpenTelemetry instruments on the global meter
//!   provider (gauges for last values, counters, histograms)

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tag key → tag value, ordered by key.
pub type Tags = BTreeMap<String, String>;

/// How repeated observations of one series combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Overwrites the previous value for the same tag set
    LastValue,
    /// Counts observations, ignoring the value
    Counter,
    /// Adds up observed values
    Sum,
    /// Tracks count, sum, min and max, plus a window of recent values
    Distribution,
}

/// Metric name as ordered segments; displayed joined with `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricName(Arc<[String]>);

impl MetricName {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// `prefix` followed by `segments`.
    pub fn prefixed<I, S>(prefix: &[String], segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            prefix
                .iter()
                .cloned()
                .chain(segments.into_iter().map(Into::into)),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// One extracted measurement on its way to a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub metric_name: MetricName,
    pub kind: MetricKind,
    pub value: f64,
    pub tags: Tags,
    pub description: Arc<str>,
    pub unit: Option<Arc<str>>,
    pub recorded_at: DateTime<Utc>,
}

/// Receiver of extracted measurements.
///
/// Called on the publishing stack; implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn record(&self, observation: Observation);
}

/// Most recent distribution samples kept per series; older ones are evicted.
pub const MAX_RETAINED_SAMPLES: usize = 1_024;

/// Aggregated state of one (metric, tag set) series.
///
/// `count` and `sum` cover every observation; `samples` only the most recent
/// [`MAX_RETAINED_SAMPLES`] of a distribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSnapshot {
    pub kind: MetricKind,
    pub last_value: f64,
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub samples: VecDeque<f64>,
    pub updated_at: DateTime<Utc>,
}

impl SeriesSnapshot {
    fn new(observation: &Observation) -> Self {
        Self {
            kind: observation.kind,
            last_value: observation.value,
            count: 0,
            sum: 0.0,
            min: None,
            max: None,
            samples: VecDeque::new(),
            updated_at: observation.recorded_at,
        }
    }

    fn apply(&mut self, observation: &Observation) {
        self.last_value = observation.value;
        self.count += 1;
        self.updated_at = observation.recorded_at;
        match observation.kind {
            MetricKind::LastValue | MetricKind::Counter => {}
            MetricKind::Sum => self.sum += observation.value,
            MetricKind::Distribution => {
                let value = observation.value;
                self.sum += value;
                self.min = Some(self.min.map_or(value, |min| min.min(value)));
                self.max = Some(self.max.map_or(value, |max| max.max(value)));
                if self.samples.len() == MAX_RETAINED_SAMPLES {
                    self.samples.pop_front();
                }
                self.samples.push_back(value);
            }
        }
    }

    /// Mean of every observation, for sums and distributions.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// In-process sink keyed by metric name and exact tag set.
#[derive(Debug, Default)]
pub struct InMemorySink {
    series: DashMap<(String, Tags), SeriesSnapshot>,
    observations: AtomicU64,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, metric: &str, tags: &Tags) -> Option<SeriesSnapshot> {
        self.series
            .get(&(metric.to_string(), tags.clone()))
            .map(|entry| entry.value().clone())
    }

    pub fn last_value(&self, metric: &str, tags: &Tags) -> Option<f64> {
        self.snapshot(metric, tags).map(|s| s.last_value)
    }

    pub fn count(&self, metric: &str, tags: &Tags) -> Option<u64> {
        self.snapshot(metric, tags).map(|s| s.count)
    }

    /// Retained distribution samples, oldest first.
    pub fn samples(&self, metric: &str, tags: &Tags) -> Vec<f64> {
        self.snapshot(metric, tags)
            .map(|s| s.samples.into_iter().collect())
            .unwrap_or_default()
    }

    /// Every series recorded for `metric`, ordered by tag set.
    pub fn series(&self, metric: &str) -> Vec<(Tags, SeriesSnapshot)> {
        let mut series: Vec<_> = self
            .series
            .iter()
            .filter(|entry| entry.key().0 == metric)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        series.sort_by(|a, b| a.0.cmp(&b.0));
        series
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.iter().map(|e| e.key().0.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Total observations recorded, across all series.
    pub fn observations_recorded(&self) -> u64 {
        self.observations.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.series.clear();
        self.observations.store(0, Ordering::Relaxed);
    }
}

impl MetricsSink for InMemorySink {
    fn record(&self, observation: Observation) {
        self.observations.fetch_add(1, Ordering::Relaxed);
        self.series
            .entry((observation.metric_name.to_string(), observation.tags.clone()))
            .or_insert_with(|| SeriesSnapshot::new(&observation))
            .apply(&observation);
    }
}

/// Sink that records through OpenTelemetry instruments.
///
/// Instruments are created lazily the first time a metric name is seen and
/// cached for the lifetime of the sink.
pub struct OtelSink {
    meter: Meter,
    gauges: DashMap<String, Gauge<f64>>,
    counters: DashMap<String, Counter<u64>>,
    sums: DashMap<String, Counter<f64>>,
    histograms: DashMap<String, Histogram<f64>>,
}

impl fmt::Debug for OtelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtelSink")
            .field("gauges", &self.gauges.len())
            .field("counters", &self.counters.len())
            .field("sums", &self.sums.len())
            .field("histograms", &self.histograms.len())
            .finish()
    }
}

impl OtelSink {
    /// Sink on the global meter provider.
    pub fn global() -> Self {
        Self::with_meter(opentelemetry::global::meter("tasker-job-metrics"))
    }

    pub fn with_meter(meter: Meter) -> Self {
        Self {
            meter,
            gauges: DashMap::new(),
            counters: DashMap::new(),
            sums: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    fn attributes(tags: &Tags) -> Vec<KeyValue> {
        tags.iter()
            .map(|(key, value)| KeyValue::new(key.clone(), value.clone()))
            .collect()
    }
}

impl MetricsSink for OtelSink {
    fn record(&self, observation: Observation) {
        let name = observation.metric_name.to_string();
        let description = observation.description.to_string();
        let unit = observation.unit.as_deref().unwrap_or("").to_string();
        let attributes = Self::attributes(&observation.tags);

        match observation.kind {
            MetricKind::LastValue => self
                .gauges
                .entry(name.clone())
                .or_insert_with(|| {
                    self.meter
                        .f64_gauge(name)
                        .with_description(description)
                        .with_unit(unit)
                        .build()
                })
                .record(observation.value, &attributes),
            MetricKind::Counter => self
                .counters
                .entry(name.clone())
                .or_insert_with(|| {
                    self.meter
                        .u64_counter(name)
                        .with_description(description)
                        .build()
                })
                .add(1, &attributes),
            MetricKind::Sum => self
                .sums
                .entry(name.clone())
                .or_insert_with(|| {
                    self.meter
                        .f64_counter(name)
                        .with_description(description)
                        .with_unit(unit)
                        .build()
                })
                .add(observation.value, &attributes),
            MetricKind::Distribution => self
                .histograms
                .entry(name.clone())
                .or_insert_with(|| {
                    self.meter
                        .f64_histogram(name)
                        .with_description(description)
                        .with_unit(unit)
                        .build()
                })
                .record(observation.value, &attributes),
        }
    }
}
