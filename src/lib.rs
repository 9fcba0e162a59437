#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Job Metrics
//!
//! Turns the lifecycle notifications of a background job processor into a
//! normalized metrics stream, without touching the job processor itself.
//!
//! ## Overview
//!
//! The job subsystem publishes notifications into an [`events::EventRegistry`].
//! Attached handlers turn them into metric observations:
//!
//! - **Metric descriptors** extract a measurement and a tag set from every
//!   matching notification, gated by an instance filter
//! - The **fan-out proxy** splits the compound supervisor init notification
//!   into one derived notification per queue
//! - The **polling scheduler** periodically samples queue lengths from each
//!   live instance's store and publishes them as synthetic notifications
//!
//! Observations go to a [`metrics::MetricsSink`]: in-memory for tests and
//! embedding, or OpenTelemetry instruments.
//!
//! ## Module Organization
//!
//! - [`names`] - Identifier normalization
//! - [`instances`] - Monitored instance set
//! - [`events`] - Notifications, metadata schemas, registry and fan-out proxy
//! - [`metrics`] - Metric descriptors and sinks
//! - [`polling`] - Poll scheduler, queue length collector, state stores
//! - [`plugin`] - Setup of every metric group
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tasker_job_metrics::config::MetricsConfig;
//! use tasker_job_metrics::events::{supervisor_init_event, EventRegistry, Notification};
//! use tasker_job_metrics::metrics::InMemorySink;
//! use tasker_job_metrics::plugin;
//! use tasker_job_metrics::polling::LiveInstances;
//!
//! let registry = Arc::new(EventRegistry::new());
//! let sink = Arc::new(InMemorySink::new());
//! plugin::setup(
//!     &MetricsConfig::default(),
//!     registry.clone(),
//!     sink.clone(),
//!     Arc::new(LiveInstances::new()),
//! )
//! .unwrap();
//!
//! registry.publish(&Notification::bare(supervisor_init_event()).with_metadata(
//!     serde_json::json!({
//!         "config": {
//!             "name": "Jobs",
//!             "queues": [["default", {"limit": 10}]],
//!             "repo": "MyApp.Repo"
//!         }
//!     }),
//! ));
//!
//! assert_eq!(sink.series("tasker.jobs.init_queue_concurrency_limit").len(), 1);
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod instances;
pub mod logging;
pub mod metrics;
pub mod names;
pub mod plugin;
pub mod polling;

pub use crate::config::MetricsConfig;
pub use error::{MetricsError, Result};
pub use events::{EventRegistry, Notification, NotificationName};
pub use instances::InstanceFilterSet;
pub use metrics::{InMemorySink, MetricDescriptor, MetricsSink, OtelSink};
pub use names::{normalize, Identifier};
pub use plugin::{setup, Instrumentation};
pub use polling::{InstanceLocator, LiveInstances, PollingScheduler, QueueStateStore};
