//! # Queue State Stores
//!
//! External state the poller samples: for each live instance, how many jobs
//! sit in each `(queue, state)` group. The liveness lookup goes through an
//! [`InstanceLocator`], the count itself through a [`QueueStateStore`].

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{MetricsError, Result};

/// Row of the grouped count query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueStateCount {
    pub queue: String,
    pub state: String,
    pub count: i64,
}

impl QueueStateCount {
    pub fn new(queue: impl Into<String>, state: impl Into<String>, count: i64) -> Self {
        Self {
            queue: queue.into(),
            state: state.into(),
            count,
        }
    }
}

/// Source of per-`(queue, state)` job counts for one instance.
#[async_trait]
pub trait QueueStateStore: Send + Sync {
    async fn queue_state_counts(&self) -> Result<Vec<QueueStateCount>>;
}

/// Liveness lookup: returns the store of an instance that is currently running.
pub trait InstanceLocator: Send + Sync {
    fn locate(&self, instance: &str) -> Option<Arc<dyn QueueStateStore>>;
}

/// Postgres-backed store reading the job table in the instance's schema.
pub struct PgQueueStateStore {
    pool: PgPool,
    instance: String,
    query: String,
}

impl std::fmt::Debug for PgQueueStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgQueueStateStore")
            .field("pool", &"PgPool")
            .field("instance", &self.instance)
            .field("query", &self.query)
            .finish()
    }
}

impl PgQueueStateStore {
    /// Store for `instance` whose jobs live in `schema.jobs`.
    pub fn new(pool: PgPool, instance: impl Into<String>, schema: &str) -> Result<Self> {
        Ok(Self {
            pool,
            instance: instance.into(),
            query: queue_counts_sql(schema)?,
        })
    }
}

#[async_trait]
impl QueueStateStore for PgQueueStateStore {
    async fn queue_state_counts(&self) -> Result<Vec<QueueStateCount>> {
        let rows = sqlx::query_as::<_, QueueStateCount>(&self.query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MetricsError::Store {
                instance: self.instance.clone(),
                reason: e.to_string(),
            })?;

        debug!(instance = %self.instance, groups = rows.len(), "Fetched queue state counts");
        Ok(rows)
    }
}

/// Grouped count query for the job table in `schema`.
///
/// The schema is interpolated into the statement, so only plain identifiers
/// are accepted.
pub fn queue_counts_sql(schema: &str) -> Result<String> {
    let valid = !schema.is_empty()
        && schema.len() <= 63
        && schema
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && schema.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid {
        return Err(MetricsError::invalid_config(
            "prefix",
            format!("'{schema}' is not a valid schema identifier"),
        ));
    }

    Ok(format!(
        "SELECT queue, state::text AS state, COUNT(*)::bigint AS count \
         FROM \"{schema}\".jobs GROUP BY queue, state ORDER BY queue, state"
    ))
}

/// In-process registry of live instances.
///
/// Instances register their store when they start and deregister on stop;
/// anything not registered is treated as not running.
#[derive(Default)]
pub struct LiveInstances {
    stores: DashMap<String, Arc<dyn QueueStateStore>>,
}

impl std::fmt::Debug for LiveInstances {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("LiveInstances").field("instances", &names).finish()
    }
}

impl LiveInstances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance: impl Into<String>, store: Arc<dyn QueueStateStore>) {
        let instance = instance.into();
        info!(instance = %instance, "Instance registered as live");
        self.stores.insert(instance, store);
    }

    pub fn deregister(&self, instance: &str) -> bool {
        let removed = self.stores.remove(instance).is_some();
        if removed {
            info!(instance = %instance, "Instance deregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

impl InstanceLocator for LiveInstances {
    fn locate(&self, instance: &str) -> Option<Arc<dyn QueueStateStore>> {
        self.stores.get(instance).map(|entry| entry.value().clone())
    }
}
