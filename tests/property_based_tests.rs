use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

use tasker_job_metrics::events::{
    fan_out_queue_limits, supervisor_init_event, EventRegistry, Notification,
};
use tasker_job_metrics::{normalize, Identifier, InstanceFilterSet};

fn queue_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}"
}

proptest! {
    /// Property: an instance is monitored under its qualified and plain spellings alike
    #[test]
    fn filter_membership_ignores_namespace(name in "[A-Z][A-Za-z]{0,12}", depth in 0usize..3) {
        let filter = InstanceFilterSet::from_names([name.clone()]);
        let qualified = Identifier::qualified(format!("{}{}", "jobs::".repeat(depth), name));
        prop_assert!(filter.contains(&qualified));
        prop_assert_eq!(normalize(&qualified), name);
    }

    /// Property: fan-out yields exactly one derived notification per queue, in order
    #[test]
    fn fan_out_preserves_queue_order(
        queues in prop::collection::vec((queue_name_strategy(), prop::option::of(0u64..500)), 0..12)
    ) {
        let pairs: Vec<serde_json::Value> = queues
            .iter()
            .map(|(name, limit)| match limit {
                Some(limit) => json!([name, {"limit": limit}]),
                None => json!([name, {}]),
            })
            .collect();
        let init = Notification::bare(supervisor_init_event()).with_metadata(json!({
            "config": {"name": "Jobs", "queues": pairs, "repo": "Repo"}
        }));

        let derived = fan_out_queue_limits(&init).unwrap();
        prop_assert_eq!(derived.len(), queues.len());
        for (notification, (name, limit)) in derived.iter().zip(&queues) {
            prop_assert_eq!(notification.metadata["queue"].as_str(), Some(name.as_str()));
            prop_assert_eq!(notification.measurement("limit"), Some(limit.unwrap_or(0) as f64));
        }
    }

    /// Property: publishing without subscribers never fails
    #[test]
    fn publish_without_subscribers_is_clean(segments in prop::collection::vec("[a-z]{1,8}", 1..5)) {
        let registry = Arc::new(EventRegistry::new());
        let report = registry.publish(&Notification::bare(
            tasker_job_metrics::NotificationName::new(segments),
        ));
        prop_assert!(report.is_clean());
        prop_assert_eq!(report.handlers_invoked, 0);
    }
}
