//! # Metrics Module
//!
//! Declarative metric descriptors and the sinks they record into.
//!
//! - `descriptor`: [`MetricDescriptor`], evaluation of a notification against
//!   a keep predicate, measurement extractor and tag extractor
//! - `sink`: the [`MetricsSink`] boundary with in-memory and OpenTelemetry
//!   implementations

pub mod descriptor;
pub mod sink;

pub use descriptor::{attach_all, tag_string, MetricDescriptor};
pub use sink::{
    InMemorySink, MetricKind, MetricName, MetricsSink, Observation, OtelSink, SeriesSnapshot,
    Tags,
};
