//! # Event Registry
//!
//! Synchronous publish/subscribe router between notification producers (the
//! job subsystem, the fan-out proxy, poll jobs) and consumers (metric
//! descriptors, the fan-out proxy).
//!
//! ## Key Features
//!
//! - **Keyed subscriptions**: re-attaching a key replaces its handler in place
//! - **Ordered dispatch**: handlers run in registration order on the caller's stack
//! - **Handler isolation**: errors and panics are caught per handler and logged
//! - **Re-entrant publish**: the read lock is released before handlers run
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tasker_job_metrics::events::{handler, EventRegistry, Notification, NotificationName};
//!
//! let registry = Arc::new(EventRegistry::new());
//! let init = NotificationName::new(["jobs", "supervisor", "init"]);
//!
//! registry
//!     .attach("init-logger", init.clone(), handler(|n| {
//!         println!("{}", n.name);
//!         Ok(())
//!     }))
//!     .unwrap();
//!
//! let report = registry.publish(&Notification::bare(init));
//! assert_eq!(report.handlers_invoked, 1);
//! ```

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::notification::{Notification, NotificationName};
use crate::error::{MetricsError, Result};

/// Handler invoked for each matching notification.
///
/// Handlers run on the publisher's stack and must not block.
pub type Handler = Arc<dyn Fn(&Notification) -> Result<()> + Send + Sync>;

/// Box a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Notification) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Subscription {
    key: String,
    source_event: NotificationName,
    handler: Handler,
    events_received: AtomicU64,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
}

impl Subscription {
    fn new(key: String, source_event: NotificationName, handler: Handler) -> Self {
        Self {
            key,
            source_event,
            handler,
            events_received: AtomicU64::new(0),
            last_event_at: Mutex::new(None),
        }
    }

    /// New handler in place of `previous`, keeping its delivery counters.
    fn replacing(
        previous: &Subscription,
        source_event: NotificationName,
        handler: Handler,
    ) -> Self {
        Self {
            key: previous.key.clone(),
            source_event,
            handler,
            events_received: AtomicU64::new(previous.events_received.load(Ordering::Relaxed)),
            last_event_at: Mutex::new(*previous.last_event_at.lock()),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("source_event", &self.source_event)
            .field("handler", &"<Handler>")
            .field("events_received", &self.events_received)
            .finish()
    }
}

/// Outcome of a single `publish` call.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub handlers_invoked: usize,
    pub failures: Vec<MetricsError>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Process-lifetime registry of keyed subscriptions.
#[derive(Debug, Default)]
pub struct EventRegistry {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `source_event` under `key`.
    ///
    /// An existing subscription with the same key is replaced where it stands,
    /// so its position in dispatch order is kept and it never runs twice. The
    /// replacement inherits `events_received` and `last_event_at`.
    pub fn attach(
        &self,
        key: impl Into<String>,
        source_event: NotificationName,
        handler: Handler,
    ) -> Result<()> {
        let key = key.into();
        if key.is_empty() {
            return Err(MetricsError::Registration(
                "subscription key cannot be empty".to_string(),
            ));
        }
        if source_event.segments().is_empty() {
            return Err(MetricsError::Registration(format!(
                "subscription '{key}' has an empty source event"
            )));
        }

        let mut subscriptions = self.subscriptions.write();

        match subscriptions.iter().position(|s| s.key == key) {
            Some(index) => {
                let replacement =
                    Subscription::replacing(&subscriptions[index], source_event.clone(), handler);
                subscriptions[index] = Arc::new(replacement);
                debug!(key = %key, event = %source_event, "Replaced existing subscription");
            }
            None => {
                subscriptions.push(Arc::new(Subscription::new(
                    key.clone(),
                    source_event.clone(),
                    handler,
                )));
                info!(key = %key, event = %source_event, "Attached subscription");
            }
        }

        Ok(())
    }

    /// Remove the subscription registered under `key`.
    pub fn detach(&self, key: &str) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.key != key);
        let removed = subscriptions.len() != before;
        if removed {
            info!(key = %key, "Detached subscription");
        }
        removed
    }

    pub fn is_attached(&self, key: &str) -> bool {
        self.subscriptions.read().iter().any(|s| s.key == key)
    }

    /// Dispatch `notification` to every handler attached to its name.
    ///
    /// A failing or panicking handler is logged and recorded in the report;
    /// the remaining handlers still run.
    pub fn publish(&self, notification: &Notification) -> DispatchReport {
        let matching: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.source_event == notification.name)
            .cloned()
            .collect();

        if matching.is_empty() {
            debug!(event = %notification.name, "No subscriptions for event");
            return DispatchReport::default();
        }

        let mut report = DispatchReport {
            handlers_invoked: matching.len(),
            failures: Vec::new(),
        };

        for subscription in matching {
            subscription.events_received.fetch_add(1, Ordering::Relaxed);
            *subscription.last_event_at.lock() = Some(Utc::now());

            let outcome = catch_unwind(AssertUnwindSafe(|| (subscription.handler)(notification)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => {
                    error!(
                        key = %subscription.key,
                        event = %notification.name,
                        error = %e,
                        "Event handler failed"
                    );
                    e
                }
                Err(payload) => {
                    error!(
                        key = %subscription.key,
                        event = %notification.name,
                        panic = %panic_message(payload.as_ref()),
                        "Event handler panicked"
                    );
                    MetricsError::HandlerPanicked {
                        key: subscription.key.clone(),
                        event: notification.name.to_string(),
                    }
                }
            };
            report.failures.push(failure);
        }

        report
    }

    pub fn stats(&self) -> RegistryStats {
        let subscriptions = self.subscriptions.read();
        let event_names: BTreeSet<&NotificationName> =
            subscriptions.iter().map(|s| &s.source_event).collect();

        let details: Vec<SubscriptionDetail> = subscriptions
            .iter()
            .map(|s| SubscriptionDetail {
                key: s.key.clone(),
                source_event: s.source_event.clone(),
                events_received: s.events_received.load(Ordering::Relaxed),
                last_event_at: *s.last_event_at.lock(),
            })
            .collect();

        RegistryStats {
            total_subscriptions: subscriptions.len(),
            total_event_names: event_names.len(),
            total_events_received: details.iter().map(|d| d.events_received).sum(),
            subscription_details: details,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Statistics about registered subscriptions
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub total_subscriptions: usize,
    pub total_event_names: usize,
    pub total_events_received: u64,
    pub subscription_details: Vec<SubscriptionDetail>,
}

/// Details about a specific subscription
#[derive(Debug, Clone)]
pub struct SubscriptionDetail {
    pub key: String,
    pub source_event: NotificationName,
    pub events_received: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}
