//! # Queue Limit Fan-Out
//!
//! The supervisor init notification nests every queue's concurrency limit
//! inside a single payload, while the metrics sink wants one (metric, tag set)
//! pair per queue. The proxy re-publishes one derived notification per queue
//! so an ordinary descriptor can record the limits.

use serde_json::json;
use std::sync::{Arc, Weak};
use tracing::debug;

use super::notification::{Notification, NotificationName};
use super::registry::{handler, EventRegistry};
use super::schema::{parse, InitQueuesMetadata};
use crate::error::Result;
use crate::names::Identifier;

/// Compound notification emitted when a supervisor starts.
pub fn supervisor_init_event() -> NotificationName {
    NotificationName::new(["jobs", "supervisor", "init"])
}

/// Derived per-queue notification published by the proxy.
pub fn queue_limit_proxy_event() -> NotificationName {
    NotificationName::new(["tasker", "jobs", "queue", "limit", "proxy"])
}

/// Attach key for the proxy under `metric_prefix`.
///
/// Including the prefix means running setup twice for the same prefix
/// replaces the proxy instead of doubling every derived notification.
pub fn proxy_key(metric_prefix: &[String]) -> String {
    format!("{}.queue_limit_proxy", metric_prefix.join("."))
}

/// Attach the queue limit proxy to `registry`.
///
/// The handler only holds a weak reference back to the registry it publishes
/// into; once the registry is dropped the proxy becomes a no-op.
pub fn attach_queue_limit_proxy(
    registry: &Arc<EventRegistry>,
    metric_prefix: &[String],
) -> Result<()> {
    let weak: Weak<EventRegistry> = Arc::downgrade(registry);
    registry.attach(
        proxy_key(metric_prefix),
        supervisor_init_event(),
        handler(move |notification| {
            let Some(registry) = weak.upgrade() else {
                return Ok(());
            };
            let derived = fan_out_queue_limits(notification)?;
            debug!(
                event = %notification.name,
                derived = derived.len(),
                "Fanning out queue limits"
            );
            for limit in &derived {
                registry.publish(limit);
            }
            Ok(())
        }),
    )
}

/// One derived notification per `(queue, options)` entry of the init payload.
///
/// Only the instance name and the queue list are read. A queue without a
/// readable limit reports `0`.
pub fn fan_out_queue_limits(notification: &Notification) -> Result<Vec<Notification>> {
    let metadata: InitQueuesMetadata = parse(&notification.metadata)?;
    let name = &metadata.config.name;

    Ok(metadata
        .config
        .queues
        .iter()
        .map(|(queue, opts)| queue_limit_notification(name, queue, opts.limit.unwrap_or(0)))
        .collect())
}

fn queue_limit_notification(name: &Identifier, queue: &str, limit: u64) -> Notification {
    Notification::bare(queue_limit_proxy_event())
        .with_measurement("limit", limit as f64)
        .with_metadata(json!({ "queue": queue, "name": name }))
}
