//! Set of monitored job-processing instances.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::names::{normalize, Identifier};

/// Name of the instance the job subsystem starts when nothing else is configured.
pub const DEFAULT_INSTANCE: &str = "Jobs";

/// Normalized instance names that metrics are collected for.
///
/// Membership is checked against normalized names so `jobs::Jobs` and `Jobs`
/// refer to the same instance. Iteration order is sorted, which keeps poll
/// ticks deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFilterSet {
    instances: BTreeSet<String>,
}

impl InstanceFilterSet {
    pub fn new<I>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = Identifier>,
    {
        Self {
            instances: identifiers.into_iter().map(|id| normalize(&id)).collect(),
        }
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(|name| Identifier::Plain(name.into())))
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.instances.contains(&normalize(identifier))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.instances.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.instances.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl Default for InstanceFilterSet {
    fn default() -> Self {
        Self::from_names([DEFAULT_INSTANCE])
    }
}
