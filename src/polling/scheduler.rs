//! # Polling Scheduler
//!
//! Runs every registered [`PollJob`] on its own periodic timer. Each tick's
//! collection runs in a separate task so a slow store never delays the timer.
//!
//! Overlapping ticks are coalesced: a tick that fires while the previous
//! collection of the same job is still running does nothing except bump the
//! job's `ticks_coalesced` counter. Stopping cancels the timers; a collection
//! already in flight runs to completion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{MetricsError, Result};
use crate::events::EventRegistry;
use crate::instances::InstanceFilterSet;
use crate::metrics::{attach_all, MetricDescriptor, MetricsSink};

/// One periodic sampling of external state.
///
/// Implementations publish synthetic notifications into `registry`; the poll
/// job's descriptors turn them into metrics.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(&self, instances: &InstanceFilterSet, registry: &EventRegistry)
        -> CollectionReport;
}

/// What a single collection did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub instances_polled: usize,
    /// Configured instances that were not live.
    pub instances_skipped: usize,
    pub instances_failed: usize,
    pub notifications_published: usize,
    pub handler_failures: usize,
}

/// A periodic polling metric group.
pub struct PollJob {
    id: Uuid,
    name: String,
    interval: Duration,
    collector: Arc<dyn Collector>,
    descriptors: Vec<MetricDescriptor>,
}

impl std::fmt::Debug for PollJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollJob")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("descriptors", &self.descriptors.len())
            .finish()
    }
}

impl PollJob {
    pub fn new(name: impl Into<String>, interval: Duration, collector: Arc<dyn Collector>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            interval,
            collector,
            descriptors: Vec::new(),
        }
    }

    /// Descriptors consuming the notifications this job's collector publishes.
    pub fn with_descriptors(mut self, descriptors: Vec<MetricDescriptor>) -> Self {
        self.descriptors = descriptors;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn descriptors(&self) -> &[MetricDescriptor] {
        &self.descriptors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollState {
    Idle,
    Collecting,
}

const IDLE: u8 = 0;
const COLLECTING: u8 = 1;

/// Runtime counters of one poll job.
#[derive(Debug, Clone, Serialize)]
pub struct PollJobStats {
    pub id: Uuid,
    pub name: String,
    pub interval_ms: u64,
    pub state: PollState,
    pub ticks_started: u64,
    pub ticks_coalesced: u64,
    pub ticks_completed: u64,
    pub last_report: Option<CollectionReport>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

struct JobRuntime {
    id: Uuid,
    name: String,
    interval: Duration,
    collector: Arc<dyn Collector>,
    state: AtomicU8,
    ticks_started: AtomicU64,
    ticks_coalesced: AtomicU64,
    ticks_completed: AtomicU64,
    last_report: Mutex<Option<CollectionReport>>,
    last_completed_at: Mutex<Option<DateTime<Utc>>>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl JobRuntime {
    fn state(&self) -> PollState {
        match self.state.load(Ordering::Acquire) {
            COLLECTING => PollState::Collecting,
            _ => PollState::Idle,
        }
    }

    /// Claim the job for a tick, or record the tick as coalesced.
    fn try_begin(self: &Arc<Self>) -> Option<CollectingGuard> {
        match self
            .state
            .compare_exchange(IDLE, COLLECTING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(CollectingGuard(Arc::clone(self))),
            Err(_) => {
                let coalesced = self.ticks_coalesced.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    job = %self.name,
                    ticks_coalesced = coalesced,
                    "Previous collection still running, coalescing tick"
                );
                None
            }
        }
    }

    async fn run(
        &self,
        _guard: CollectingGuard,
        instances: &InstanceFilterSet,
        registry: &EventRegistry,
    ) -> CollectionReport {
        let tick = self.ticks_started.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        debug!(job = %self.name, tick = tick, "Running poll collection");

        let report = self.collector.collect(instances, registry).await;

        self.ticks_completed.fetch_add(1, Ordering::Relaxed);
        *self.last_report.lock() = Some(report.clone());
        *self.last_completed_at.lock() = Some(Utc::now());

        if report.instances_failed > 0 || report.handler_failures > 0 {
            warn!(
                job = %self.name,
                tick = tick,
                instances_failed = report.instances_failed,
                handler_failures = report.handler_failures,
                notifications_published = report.notifications_published,
                duration_ms = started.elapsed().as_millis() as u64,
                "Poll collection completed with failures"
            );
        } else {
            debug!(
                job = %self.name,
                tick = tick,
                instances_polled = report.instances_polled,
                instances_skipped = report.instances_skipped,
                notifications_published = report.notifications_published,
                duration_ms = started.elapsed().as_millis() as u64,
                "Poll collection completed"
            );
        }
        report
    }

    fn stats(&self) -> PollJobStats {
        PollJobStats {
            id: self.id,
            name: self.name.clone(),
            interval_ms: self.interval.as_millis() as u64,
            state: self.state(),
            ticks_started: self.ticks_started.load(Ordering::Relaxed),
            ticks_coalesced: self.ticks_coalesced.load(Ordering::Relaxed),
            ticks_completed: self.ticks_completed.load(Ordering::Relaxed),
            last_report: self.last_report.lock().clone(),
            last_completed_at: *self.last_completed_at.lock(),
        }
    }
}

/// Holds a job in `Collecting`; dropping it returns the job to `Idle`, also
/// when the collection panicked or was cancelled.
struct CollectingGuard(Arc<JobRuntime>);

impl Drop for CollectingGuard {
    fn drop(&mut self) {
        self.0.state.store(IDLE, Ordering::Release);
    }
}

/// Owner of every poll job's timer.
pub struct PollingScheduler {
    scheduler_id: Uuid,
    registry: Arc<EventRegistry>,
    instances: Arc<InstanceFilterSet>,
    jobs: Vec<Arc<JobRuntime>>,
    timers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("scheduler_id", &self.scheduler_id)
            .field("instances", &self.instances)
            .field(
                "jobs",
                &self.jobs.iter().map(|job| job.name.as_str()).collect::<Vec<_>>(),
            )
            .field("running", &self.is_running())
            .finish()
    }
}

impl PollingScheduler {
    pub fn new(registry: Arc<EventRegistry>, instances: InstanceFilterSet) -> Self {
        let scheduler_id = Uuid::new_v4();
        info!(
            scheduler_id = %scheduler_id,
            instances = instances.len(),
            "Creating PollingScheduler"
        );
        Self {
            scheduler_id,
            registry,
            instances: Arc::new(instances),
            jobs: Vec::new(),
            timers: Vec::new(),
        }
    }

    /// Register a poll job and attach its descriptors to the registry.
    ///
    /// Jobs can only be added before [`start`](Self::start).
    pub fn add_job(&mut self, job: PollJob, sink: Arc<dyn MetricsSink>) -> Result<()> {
        if self.is_running() {
            return Err(MetricsError::Scheduler(format!(
                "cannot add poll job '{}' while the scheduler is running",
                job.name
            )));
        }
        if job.interval.is_zero() {
            return Err(MetricsError::invalid_config(
                "poll_interval_ms",
                format!("poll job '{}' needs a non-zero interval", job.name),
            ));
        }
        if self.jobs.iter().any(|existing| existing.name == job.name) {
            return Err(MetricsError::Registration(format!(
                "poll job '{}' is already registered",
                job.name
            )));
        }

        let attached = attach_all(&self.registry, sink, job.descriptors)?;
        info!(
            scheduler_id = %self.scheduler_id,
            job = %job.name,
            job_id = %job.id,
            interval_ms = job.interval.as_millis() as u64,
            descriptors = attached,
            "Registered poll job"
        );

        self.jobs.push(Arc::new(JobRuntime {
            id: job.id,
            name: job.name,
            interval: job.interval,
            collector: job.collector,
            state: AtomicU8::new(IDLE),
            ticks_started: AtomicU64::new(0),
            ticks_coalesced: AtomicU64::new(0),
            ticks_completed: AtomicU64::new(0),
            last_report: Mutex::new(None),
            last_completed_at: Mutex::new(None),
            in_flight: Mutex::new(None),
        }));
        Ok(())
    }

    /// Start one timer task per job. Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            warn!(scheduler_id = %self.scheduler_id, "Polling scheduler already running");
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| MetricsError::Scheduler(format!("no tokio runtime available: {e}")))?;

        for job in &self.jobs {
            info!(
                scheduler_id = %self.scheduler_id,
                job = %job.name,
                interval_ms = job.interval.as_millis() as u64,
                "Starting poll job timer"
            );
            let job = Arc::clone(job);
            let registry = Arc::clone(&self.registry);
            let instances = Arc::clone(&self.instances);
            let collections = runtime.clone();

            self.timers.push(runtime.spawn(async move {
                let mut ticker = interval(job.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    ticker.tick().await;

                    let Some(guard) = job.try_begin() else {
                        continue;
                    };

                    let runner = Arc::clone(&job);
                    let registry = Arc::clone(&registry);
                    let instances = Arc::clone(&instances);
                    let collection = collections.spawn(async move {
                        runner.run(guard, &instances, &registry).await;
                    });
                    *job.in_flight.lock() = Some(collection);
                }
            }));
        }
        Ok(())
    }

    /// Cancel every timer. In-flight collections keep running.
    pub fn stop(&mut self) {
        if self.timers.is_empty() {
            return;
        }
        info!(scheduler_id = %self.scheduler_id, "Stopping polling scheduler");
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }

    /// Cancel every timer and wait for in-flight collections to finish.
    pub async fn shutdown(&mut self) {
        let timers: Vec<JoinHandle<()>> = self.timers.drain(..).collect();
        for timer in &timers {
            timer.abort();
        }
        futures::future::join_all(timers).await;

        let in_flight: Vec<JoinHandle<()>> = self
            .jobs
            .iter()
            .filter_map(|job| job.in_flight.lock().take())
            .collect();
        let waiting = in_flight.len();
        for result in futures::future::join_all(in_flight).await {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!(
                        scheduler_id = %self.scheduler_id,
                        error = %e,
                        "Poll collection panicked"
                    );
                }
            }
        }

        info!(
            scheduler_id = %self.scheduler_id,
            awaited_collections = waiting,
            "Polling scheduler shut down"
        );
    }

    /// Run one collection of every job now, on the caller's task.
    ///
    /// Follows the same coalescing rule as timer ticks: a job that is already
    /// collecting yields `None`.
    pub async fn run_once(&self) -> Vec<Option<CollectionReport>> {
        let mut reports = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let report = match job.try_begin() {
                Some(guard) => Some(job.run(guard, &self.instances, &self.registry).await),
                None => None,
            };
            reports.push(report);
        }
        reports
    }

    pub fn is_running(&self) -> bool {
        !self.timers.is_empty()
    }

    pub fn scheduler_id(&self) -> Uuid {
        self.scheduler_id
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn stats(&self) -> Vec<PollJobStats> {
        self.jobs.iter().map(|job| job.stats()).collect()
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        for timer in &self.timers {
            timer.abort();
        }
    }
}
