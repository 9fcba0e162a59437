//! # Job Metrics Plugin
//!
//! Setup wiring: builds every metric group for the configured instances and
//! metric prefix, attaches them to a registry, and prepares the polling
//! scheduler.
//!
//! Groups:
//!
//! - **init**: supervisor status info and configured durations, read from the
//!   compound `jobs.supervisor.init` notification
//! - **queue limits**: per-queue concurrency limits, fed by the fan-out proxy
//! - **jobs**: processing time, queue time, completions and exceptions
//! - **circuit**: circuit breaker trips and opens
//! - **polling**: queue length by state, sampled on a timer
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tasker_job_metrics::config::MetricsConfig;
//! use tasker_job_metrics::events::EventRegistry;
//! use tasker_job_metrics::metrics::InMemorySink;
//! use tasker_job_metrics::plugin;
//! use tasker_job_metrics::polling::LiveInstances;
//!
//! # async fn run() -> tasker_job_metrics::Result<()> {
//! let registry = Arc::new(EventRegistry::new());
//! let mut instrumentation = plugin::setup(
//!     &MetricsConfig::from_env()?,
//!     registry.clone(),
//!     Arc::new(InMemorySink::new()),
//!     Arc::new(LiveInstances::new()),
//! )?;
//! instrumentation.start()?;
//! // ... job subsystem publishes into `registry` ...
//! instrumentation.shutdown().await;
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::MetricsConfig;
use crate::error::Result;
use crate::events::notification::{Measurements, NotificationName};
use crate::events::schema::{
    parse, CircuitMetadata, JobMetadata, QueueLimitMetadata, SupervisorConfig,
    SupervisorInitMetadata,
};
use crate::events::{
    attach_queue_limit_proxy, queue_limit_proxy_event, supervisor_init_event, EventRegistry,
    RegistryStats,
};
use crate::instances::InstanceFilterSet;
use crate::logging::log_pipeline_operation;
use crate::metrics::{attach_all, MetricDescriptor, MetricsSink, Tags};
use crate::names::{normalize_list, Identifier};
use crate::polling::{
    queue_length_poll_job, CollectionReport, InstanceLocator, PollJob, PollJobStats,
    PollingScheduler,
};

const NANOS_TO_MILLIS: f64 = 1e-6;

pub fn job_stop_event() -> NotificationName {
    NotificationName::new(["jobs", "job", "stop"])
}

pub fn job_exception_event() -> NotificationName {
    NotificationName::new(["jobs", "job", "exception"])
}

pub fn circuit_trip_event() -> NotificationName {
    NotificationName::new(["jobs", "circuit", "trip"])
}

pub fn circuit_open_event() -> NotificationName {
    NotificationName::new(["jobs", "circuit", "open"])
}

fn metric_path<'a>(prefix: &'a [String], family: &'a str) -> impl Iterator<Item = &'a str> {
    prefix.iter().map(String::as_str).chain(std::iter::once(family))
}

fn tag(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_string(), value.into())
}

/// Supervisor status info and configured durations.
pub fn init_metrics(prefix: &[String], filter: &InstanceFilterSet) -> Vec<MetricDescriptor> {
    let status = MetricDescriptor::last_value(
        metric_path(prefix, "init_status_info"),
        supervisor_init_event(),
    )
    .description("Information regarding the job supervisor's running configuration.")
    .constant(1.0)
    .tags(["name", "node", "plugins", "prefix", "queues", "repo"])
    .tag_values_from::<SupervisorInitMetadata, _>(|init| {
        let config = &init.config;
        let plugins = normalize_list(config.plugins.iter().map(|plugin| plugin.identifier()));
        Tags::from([
            tag("name", config.name.normalized()),
            tag("node", config.node.clone()),
            tag("plugins", plugins),
            tag("prefix", config.prefix.clone()),
            tag("queues", config.queues.names().collect::<Vec<_>>().join(",")),
            tag(
                "repo",
                config.repo.as_ref().map(Identifier::normalized).unwrap_or_default(),
            ),
        ])
    })
    .keep_instances::<SupervisorInitMetadata>(filter.clone());

    let durations: [(&str, &str, fn(&SupervisorConfig) -> Option<f64>); 4] = [
        (
            "init_circuit_backoff_milliseconds",
            "The job supervisor's circuit backoff period.",
            |config| config.circuit_backoff,
        ),
        (
            "init_shutdown_grace_period_milliseconds",
            "The time the job supervisor waits for running jobs before shutting down.",
            |config| config.shutdown_grace_period,
        ),
        (
            "init_poll_interval_milliseconds",
            "How often the job supervisor polls for scheduled jobs.",
            |config| config.poll_interval,
        ),
        (
            "init_dispatch_cooldown_milliseconds",
            "The minimum time between job dispatches.",
            |config| config.dispatch_cooldown,
        ),
    ];

    std::iter::once(status)
        .chain(durations.into_iter().map(|(family, description, field)| {
            MetricDescriptor::last_value(metric_path(prefix, family), supervisor_init_event())
                .description(description)
                .unit("ms")
                .measurement(move |_: &Measurements, metadata: &Value| {
                    parse::<SupervisorInitMetadata>(metadata)
                        .ok()
                        .and_then(|init| field(&init.config))
                })
                .tags(["name"])
                .tag_values_from::<SupervisorInitMetadata, _>(|init| {
                    Tags::from([tag("name", init.config.name.normalized())])
                })
                .keep_instances::<SupervisorInitMetadata>(filter.clone())
        }))
        .collect()
}

/// Per-queue concurrency limits, fed by the fan-out proxy.
pub fn queue_limit_metrics(prefix: &[String], filter: &InstanceFilterSet) -> Vec<MetricDescriptor> {
    vec![MetricDescriptor::last_value(
        metric_path(prefix, "init_queue_concurrency_limit"),
        queue_limit_proxy_event(),
    )
    .description("The concurrency limits of each of the job queues.")
    .measurement_key("limit")
    .tags(["name", "queue"])
    .tag_values_from::<QueueLimitMetadata, _>(|limit| {
        Tags::from([
            tag("name", limit.name.normalized()),
            tag("queue", limit.queue.clone()),
        ])
    })
    .keep_instances::<QueueLimitMetadata>(filter.clone())]
}

fn job_tags(job: &JobMetadata) -> Tags {
    Tags::from([
        tag("name", job.conf.name.normalized()),
        tag("queue", job.job.queue.clone()),
        tag("state", job.state.clone().unwrap_or_else(|| "unknown".to_string())),
        tag("worker", job.job.worker.normalized()),
    ])
}

fn job_exception_tags(job: &JobMetadata) -> Tags {
    Tags::from([
        tag("name", job.conf.name.normalized()),
        tag("queue", job.job.queue.clone()),
        tag("kind", job.kind.clone().unwrap_or_else(|| "error".to_string())),
        tag("worker", job.job.worker.normalized()),
    ])
}

/// Job completion and exception metrics.
///
/// Durations arrive in nanoseconds and are recorded in milliseconds.
pub fn job_event_metrics(prefix: &[String], filter: &InstanceFilterSet) -> Vec<MetricDescriptor> {
    let stop_tags = ["name", "queue", "state", "worker"];
    let exception_tags = ["name", "queue", "kind", "worker"];

    vec![
        MetricDescriptor::distribution(
            metric_path(prefix, "job_processing_duration_milliseconds"),
            job_stop_event(),
        )
        .description("The amount of time it takes to process a job.")
        .unit("ms")
        .scaled_measurement("duration", NANOS_TO_MILLIS)
        .tags(stop_tags)
        .tag_values_from::<JobMetadata, _>(job_tags)
        .keep_instances::<JobMetadata>(filter.clone()),
        MetricDescriptor::distribution(
            metric_path(prefix, "job_queue_time_milliseconds"),
            job_stop_event(),
        )
        .description("The amount of time a job waits in the queue before processing starts.")
        .unit("ms")
        .scaled_measurement("queue_time", NANOS_TO_MILLIS)
        .tags(stop_tags)
        .tag_values_from::<JobMetadata, _>(job_tags)
        .keep_instances::<JobMetadata>(filter.clone()),
        MetricDescriptor::counter(metric_path(prefix, "job_complete_total"), job_stop_event())
            .description("The number of jobs that have finished processing.")
            .constant(1.0)
            .tags(stop_tags)
            .tag_values_from::<JobMetadata, _>(job_tags)
            .keep_instances::<JobMetadata>(filter.clone()),
        MetricDescriptor::distribution(
            metric_path(prefix, "job_exception_duration_milliseconds"),
            job_exception_event(),
        )
        .description("The amount of time a job ran before raising an exception.")
        .unit("ms")
        .scaled_measurement("duration", NANOS_TO_MILLIS)
        .tags(exception_tags)
        .tag_values_from::<JobMetadata, _>(job_exception_tags)
        .keep_instances::<JobMetadata>(filter.clone()),
        MetricDescriptor::counter(
            metric_path(prefix, "job_exception_total"),
            job_exception_event(),
        )
        .description("The number of jobs that raised an exception.")
        .constant(1.0)
        .tags(exception_tags)
        .tag_values_from::<JobMetadata, _>(job_exception_tags)
        .keep_instances::<JobMetadata>(filter.clone()),
    ]
}

/// Keep circuit events from monitored instances, and those naming no instance.
fn keep_circuit(filter: InstanceFilterSet) -> impl Fn(&Value) -> bool + Send + Sync + 'static {
    move |metadata: &Value| match parse::<CircuitMetadata>(metadata) {
        Ok(circuit) => circuit.conf.map_or(true, |conf| filter.contains(&conf.name)),
        Err(_) => false,
    }
}

pub fn circuit_event_metrics(
    prefix: &[String],
    filter: &InstanceFilterSet,
) -> Vec<MetricDescriptor> {
    [
        ("circuit_trip_total", circuit_trip_event(), "The number of circuit breaker trips."),
        ("circuit_open_total", circuit_open_event(), "The number of circuit breaker openings."),
    ]
    .into_iter()
    .map(|(family, event, description)| {
        MetricDescriptor::counter(metric_path(prefix, family), event)
            .description(description)
            .constant(1.0)
            .tags(["name"])
            .tag_values_from::<CircuitMetadata, _>(|circuit| {
                Tags::from([tag("name", circuit.name.normalized())])
            })
            .keep(keep_circuit(filter.clone()))
    })
    .collect()
}

/// Every notification-driven descriptor, in attach order.
pub fn event_metrics(prefix: &[String], filter: &InstanceFilterSet) -> Vec<MetricDescriptor> {
    let mut descriptors = init_metrics(prefix, filter);
    descriptors.extend(queue_limit_metrics(prefix, filter));
    descriptors.extend(job_event_metrics(prefix, filter));
    descriptors.extend(circuit_event_metrics(prefix, filter));
    descriptors
}

pub fn polling_metrics(
    prefix: &[String],
    filter: &InstanceFilterSet,
    interval: Duration,
    locator: Arc<dyn InstanceLocator>,
) -> Vec<PollJob> {
    vec![queue_length_poll_job(prefix, filter.clone(), interval, locator)]
}

/// Attached pipeline: the registry it lives on and the polling scheduler.
#[derive(Debug)]
pub struct Instrumentation {
    registry: Arc<EventRegistry>,
    scheduler: PollingScheduler,
    metric_prefix: Vec<String>,
    descriptors_attached: usize,
}

impl Instrumentation {
    /// Start the poll timers. Requires a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        self.scheduler.start()?;
        log_pipeline_operation("start", "polling_scheduler", "running", None);
        Ok(())
    }

    /// Stop the poll timers and wait for in-flight collections.
    pub async fn shutdown(&mut self) {
        self.scheduler.shutdown().await;
        log_pipeline_operation("shutdown", "polling_scheduler", "stopped", None);
    }

    /// Run every poll job once, outside the timers.
    pub async fn poll_now(&self) -> Vec<Option<CollectionReport>> {
        self.scheduler.run_once().await
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    pub fn metric_prefix(&self) -> &[String] {
        &self.metric_prefix
    }

    pub fn descriptors_attached(&self) -> usize {
        self.descriptors_attached
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn poll_stats(&self) -> Vec<PollJobStats> {
        self.scheduler.stats()
    }
}

/// Validate `config`, then attach every metric group and the queue limit
/// proxy to `registry` and prepare (but do not start) the poll jobs.
///
/// Invalid configuration fails before anything is attached.
pub fn setup(
    config: &MetricsConfig,
    registry: Arc<EventRegistry>,
    sink: Arc<dyn MetricsSink>,
    locator: Arc<dyn InstanceLocator>,
) -> Result<Instrumentation> {
    config.validate()?;

    let prefix = config.metric_prefix.clone();
    let filter = config.instance_filter();
    let descriptors = event_metrics(&prefix, &filter);
    let poll_jobs = polling_metrics(&prefix, &filter, config.poll_interval(), locator);

    let mut descriptors_attached = attach_all(&registry, sink.clone(), descriptors)?;
    attach_queue_limit_proxy(&registry, &prefix)?;

    let mut scheduler = PollingScheduler::new(registry.clone(), filter.clone());
    for job in poll_jobs {
        descriptors_attached += job.descriptors().len();
        scheduler.add_job(job, sink.clone())?;
    }

    info!(
        metric_prefix = %prefix.join("."),
        instances = filter.len(),
        descriptors = descriptors_attached,
        poll_jobs = scheduler.job_count(),
        poll_interval_ms = config.poll_interval_ms,
        "Job metrics attached"
    );
    log_pipeline_operation("setup", "job_metrics", "attached", None);

    Ok(Instrumentation {
        registry,
        scheduler,
        metric_prefix: prefix,
        descriptors_attached,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Notification;
    use crate::metrics::InMemorySink;
    use crate::polling::LiveInstances;
    use serde_json::json;

    fn prefix() -> Vec<String> {
        vec!["tasker".to_string(), "jobs".to_string()]
    }

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| tag(k, *v)).collect()
    }

    fn attached(filter: InstanceFilterSet) -> (EventRegistry, Arc<InMemorySink>) {
        let registry = EventRegistry::new();
        let sink = Arc::new(InMemorySink::new());
        attach_all(&registry, sink.clone(), event_metrics(&prefix(), &filter)).unwrap();
        (registry, sink)
    }

    fn init_notification(name: &str) -> Notification {
        Notification::bare(supervisor_init_event()).with_metadata(json!({
            "config": {
                "name": {"module": format!("jobs::{name}")},
                "node": "worker@host-1",
                "plugins": [[{"module": "jobs::Plugins.Pruner"}, {"max_age": 60}], "Lifeline"],
                "prefix": "public",
                "queues": [["default", {"limit": 10}], ["mailers", {"limit": 5}]],
                "repo": {"module": "jobs::MyApp.Repo"},
                "circuit_backoff": 30000,
                "shutdown_grace_period": 15000,
                "poll_interval": 1000,
                "dispatch_cooldown": 5
            }
        }))
    }

    fn job_stop(instance: &str) -> Notification {
        Notification::bare(job_stop_event())
            .with_measurement("duration", 2_500_000.0)
            .with_measurement("queue_time", 1_000_000.0)
            .with_metadata(json!({
                "conf": {"name": instance},
                "job": {
                    "queue": "default",
                    "worker": {"module": "jobs::MyApp.Mailer"},
                    "attempt": 1
                },
                "state": "success"
            }))
    }

    #[test]
    fn test_init_status_and_durations() {
        let (registry, sink) = attached(InstanceFilterSet::default());
        let report = registry.publish(&init_notification("Jobs"));
        assert!(report.is_clean());

        let info = sink.series("tasker.jobs.init_status_info");
        assert_eq!(info.len(), 1);
        let (info_tags, snapshot) = &info[0];
        assert_eq!(snapshot.last_value, 1.0);
        assert_eq!(info_tags["name"], "Jobs");
        assert_eq!(info_tags["plugins"], "Plugins.Pruner,Lifeline");
        assert_eq!(info_tags["queues"], "default,mailers");
        assert_eq!(info_tags["repo"], "MyApp.Repo");

        let name = tags(&[("name", "Jobs")]);
        assert_eq!(
            sink.last_value("tasker.jobs.init_circuit_backoff_milliseconds", &name),
            Some(30000.0)
        );
        assert_eq!(
            sink.last_value("tasker.jobs.init_dispatch_cooldown_milliseconds", &name),
            Some(5.0)
        );
    }

    #[test]
    fn test_init_metrics_survive_off_shape_fields() {
        let (registry, sink) = attached(InstanceFilterSet::default());
        let init = Notification::bare(supervisor_init_event()).with_metadata(json!({
            "config": {
                "name": "Jobs",
                "node": null,
                "queues": [["default", {"limit": 10}], ["bulk", {"limit": 2.5}]],
                "poll_interval": 1000
            }
        }));
        assert!(registry.publish(&init).is_clean());

        let info = sink.series("tasker.jobs.init_status_info");
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].0["repo"], "");
        assert_eq!(info[0].0["node"], "");
        assert_eq!(
            sink.last_value(
                "tasker.jobs.init_poll_interval_milliseconds",
                &tags(&[("name", "Jobs")])
            ),
            Some(1000.0)
        );
    }

    #[test]
    fn test_unmonitored_instance_records_nothing() {
        let (registry, sink) = attached(InstanceFilterSet::default());
        registry.publish(&init_notification("Billing"));
        registry.publish(&job_stop("Billing"));
        assert_eq!(sink.observations_recorded(), 0);
    }

    #[test]
    fn test_job_stop_metrics_scaled_to_millis() {
        let (registry, sink) = attached(InstanceFilterSet::default());
        registry.publish(&job_stop("Jobs"));
        registry.publish(&job_stop("Jobs"));

        let series = tags(&[
            ("name", "Jobs"),
            ("queue", "default"),
            ("state", "success"),
            ("worker", "MyApp.Mailer"),
        ]);
        assert_eq!(
            sink.samples("tasker.jobs.job_processing_duration_milliseconds", &series),
            vec![2.5, 2.5]
        );
        assert_eq!(
            sink.samples("tasker.jobs.job_queue_time_milliseconds", &series),
            vec![1.0, 1.0]
        );
        assert_eq!(sink.count("tasker.jobs.job_complete_total", &series), Some(2));
    }

    #[test]
    fn test_job_exception_defaults_kind() {
        let (registry, sink) = attached(InstanceFilterSet::default());
        registry.publish(
            &Notification::bare(job_exception_event())
                .with_measurement("duration", 4_000_000.0)
                .with_metadata(json!({
                    "conf": {"name": "Jobs"},
                    "job": {"queue": "default", "worker": "Reports"},
                    "error": "timeout"
                })),
        );

        let series = tags(&[
            ("name", "Jobs"),
            ("queue", "default"),
            ("kind", "error"),
            ("worker", "Reports"),
        ]);
        assert_eq!(sink.count("tasker.jobs.job_exception_total", &series), Some(1));
        assert_eq!(
            sink.samples("tasker.jobs.job_exception_duration_milliseconds", &series),
            vec![4.0]
        );
    }

    #[test]
    fn test_circuit_events_without_instance_are_kept() {
        let (registry, sink) = attached(InstanceFilterSet::default());
        registry.publish(
            &Notification::bare(circuit_trip_event())
                .with_metadata(json!({"name": {"module": "jobs::Stager"}})),
        );
        registry.publish(
            &Notification::bare(circuit_open_event())
                .with_metadata(json!({"conf": {"name": "Billing"}, "name": "Stager"})),
        );

        let breaker = tags(&[("name", "Stager")]);
        assert_eq!(sink.count("tasker.jobs.circuit_trip_total", &breaker), Some(1));
        assert_eq!(sink.count("tasker.jobs.circuit_open_total", &breaker), None);
    }

    #[tokio::test]
    async fn test_setup_attaches_everything_once() {
        let registry = Arc::new(EventRegistry::new());
        let sink = Arc::new(InMemorySink::new());
        let live = Arc::new(LiveInstances::new());
        let config = MetricsConfig::default();

        let first = setup(&config, registry.clone(), sink.clone(), live.clone()).unwrap();
        let subscriptions = registry.stats().total_subscriptions;
        assert_eq!(first.descriptors_attached(), 14);
        // 14 descriptors plus the proxy
        assert_eq!(subscriptions, 15);

        let _second = setup(&config, registry.clone(), sink.clone(), live).unwrap();
        assert_eq!(registry.stats().total_subscriptions, subscriptions);

        registry.publish(&init_notification("Jobs"));
        let limits = sink.series("tasker.jobs.init_queue_concurrency_limit");
        assert_eq!(limits.len(), 2);
        assert!(limits.iter().all(|(_, snapshot)| snapshot.count == 1));
    }

    #[test]
    fn test_invalid_config_attaches_nothing() {
        let registry = Arc::new(EventRegistry::new());
        let config = MetricsConfig {
            poll_interval_ms: 0,
            ..MetricsConfig::default()
        };

        let result = setup(
            &config,
            registry.clone(),
            Arc::new(InMemorySink::new()),
            Arc::new(LiveInstances::new()),
        );
        assert!(result.is_err());
        assert_eq!(registry.stats().total_subscriptions, 0);
    }
}
