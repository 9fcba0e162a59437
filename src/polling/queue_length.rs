//! # Queue Length Polling
//!
//! Samples how many jobs sit in each `(queue, state)` group of every live,
//! monitored instance and publishes one synthetic notification per group.

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::scheduler::{CollectionReport, Collector, PollJob};
use super::store::{InstanceLocator, QueueStateCount};
use crate::events::registry::panic_message;
use crate::events::schema::QueueLengthMetadata;
use crate::events::{EventRegistry, Notification, NotificationName};
use crate::instances::InstanceFilterSet;
use crate::metrics::{MetricDescriptor, Tags};

pub const QUEUE_LENGTH_JOB: &str = "queue_length";

/// Synthetic notification published per `(queue, state)` row.
pub fn queue_length_event() -> NotificationName {
    NotificationName::new(["tasker", "plugin", "jobs", "queue", "length", "count"])
}

pub struct QueueLengthCollector {
    locator: Arc<dyn InstanceLocator>,
}

impl std::fmt::Debug for QueueLengthCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueLengthCollector").finish_non_exhaustive()
    }
}

impl QueueLengthCollector {
    pub fn new(locator: Arc<dyn InstanceLocator>) -> Self {
        Self { locator }
    }
}

#[async_trait]
impl Collector for QueueLengthCollector {
    async fn collect(
        &self,
        instances: &InstanceFilterSet,
        registry: &EventRegistry,
    ) -> CollectionReport {
        let mut report = CollectionReport::default();

        for instance in instances.iter() {
            let Some(store) = self.locator.locate(instance) else {
                debug!(instance = %instance, "Instance not running, skipping queue length poll");
                report.instances_skipped += 1;
                continue;
            };

            let outcome = AssertUnwindSafe(store.queue_state_counts())
                .catch_unwind()
                .await;
            let rows = match outcome {
                Ok(Ok(rows)) => rows,
                Ok(Err(e)) => {
                    error!(instance = %instance, error = %e, "Queue length poll failed");
                    report.instances_failed += 1;
                    continue;
                }
                Err(payload) => {
                    error!(
                        instance = %instance,
                        panic = %panic_message(payload.as_ref()),
                        "Queue state store panicked"
                    );
                    report.instances_failed += 1;
                    continue;
                }
            };

            report.instances_polled += 1;
            for row in &rows {
                let dispatch = registry.publish(&queue_length_notification(instance, row));
                report.notifications_published += 1;
                report.handler_failures += dispatch.failures.len();
            }
        }

        report
    }
}

fn queue_length_notification(instance: &str, row: &QueueStateCount) -> Notification {
    Notification::bare(queue_length_event())
        .with_measurement("count", row.count as f64)
        .with_metadata(json!({
            "name": instance,
            "queue": row.queue,
            "state": row.state,
        }))
}

/// `queue_length_count`: jobs per instance, queue and state.
pub fn queue_length_descriptor(prefix: &[String], filter: InstanceFilterSet) -> MetricDescriptor {
    MetricDescriptor::last_value(
        prefix.iter().map(String::as_str).chain(["queue_length_count"]),
        queue_length_event(),
    )
    .description("The number of jobs currently in the queue, by state.")
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

/// Poll job sampling queue lengths every `interval`.
pub fn queue_length_poll_job(
    prefix: &[String],
    filter: InstanceFilterSet,
    interval: Duration,
    locator: Arc<dyn InstanceLocator>,
) -> PollJob {
    PollJob::new(
        QUEUE_LENGTH_JOB,
        interval,
        Arc::new(QueueLengthCollector::new(locator)),
    )
    .with_descriptors(vec![queue_length_descriptor(prefix, filter)])
}
