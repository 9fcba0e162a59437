//! Notification names and records flowing through the registry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered symbolic segments used as a dispatch key, e.g. `jobs.supervisor.init`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationName(Vec<String>);

impl NotificationName {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Name formed by appending `segments` to `self`.
    pub fn join<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = self.0.clone();
        all.extend(segments.into_iter().map(Into::into));
        Self(all)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for NotificationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

pub type Measurements = BTreeMap<String, f64>;

/// An immutable event record.
///
/// Handlers only ever see `&Notification`; anything derived from it is a new
/// notification published separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub name: NotificationName,
    pub measurements: Measurements,
    pub metadata: Value,
}

impl Notification {
    pub fn new(name: NotificationName, measurements: Measurements, metadata: Value) -> Self {
        Self {
            name,
            measurements,
            metadata,
        }
    }

    /// Notification with no measurements and an empty metadata object.
    pub fn bare(name: NotificationName) -> Self {
        Self::new(name, Measurements::new(), Value::Object(Map::new()))
    }

    pub fn with_measurement(mut self, key: impl Into<String>, value: f64) -> Self {
        self.measurements.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn measurement(&self, key: &str) -> Option<f64> {
        self.measurements.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_name_equality_is_structural() {
        let a = NotificationName::new(["jobs", "supervisor", "init"]);
        let b = NotificationName::new(vec!["jobs".to_string()]).join(["supervisor", "init"]);
        assert_eq!(a, b);
        assert_ne!(a, NotificationName::new(["jobs", "supervisor"]));
        assert_eq!(a.to_string(), "jobs.supervisor.init");
    }

    #[test]
    fn test_builder_helpers() {
        let n = Notification::bare(NotificationName::new(["a"]))
            .with_measurement("count", 3.0)
            .with_metadata(json!({"queue": "default"}));
        assert_eq!(n.measurement("count"), Some(3.0));
        assert_eq!(n.measurement("missing"), None);
        assert_eq!(n.metadata["queue"], "default");
    }
}
