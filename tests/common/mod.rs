//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tasker_job_metrics::events::supervisor_init_event;
use tasker_job_metrics::metrics::Tags;
use tasker_job_metrics::polling::{QueueStateCount, QueueStateStore};
use tasker_job_metrics::{MetricsError, Notification, Result};

/// Store returning whatever rows it currently holds.
#[derive(Default)]
pub struct ScriptedStore {
    rows: Mutex<Vec<QueueStateCount>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedStore {
    pub fn with_rows(rows: Vec<QueueStateCount>) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(rows),
            ..Self::default()
        })
    }

    pub fn slow(rows: Vec<QueueStateCount>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(rows),
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn set_rows(&self, rows: Vec<QueueStateCount>) {
        *self.rows.lock() = rows;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueStateStore for ScriptedStore {
    async fn queue_state_counts(&self) -> Result<Vec<QueueStateCount>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.rows.lock().clone())
    }
}

pub struct UnreachableStore;

#[async_trait]
impl QueueStateStore for UnreachableStore {
    async fn queue_state_counts(&self) -> Result<Vec<QueueStateCount>> {
        Err(MetricsError::Store {
            instance: "unreachable".to_string(),
            reason: "pool timed out".to_string(),
        })
    }
}

pub fn init_notification(instance: &str, queues: serde_json::Value) -> Notification {
    Notification::bare(supervisor_init_event()).with_metadata(json!({
        "config": {
            "name": {"module": format!("jobs::{instance}")},
            "node": "worker@host-1",
            "plugins": [],
            "prefix": "public",
            "queues": queues,
            "repo": {"module": "jobs::MyApp.Repo"},
            "circuit_backoff": 30000,
            "shutdown_grace_period": 15000,
            "poll_interval": 1000,
            "dispatch_cooldown": 5
        }
    }))
}

pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
