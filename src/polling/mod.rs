//! # Polling
//!
//! Periodic sampling of state the job subsystem does not emit notifications
//! for. The scheduler owns the timers; collectors turn store rows into
//! synthetic notifications that flow through the ordinary registry.

pub mod queue_length;
pub mod scheduler;
pub mod store;

pub use queue_length::{
    queue_length_descriptor, queue_length_event, queue_length_poll_job, QueueLengthCollector,
};
pub use scheduler::{
    CollectionReport, Collector, PollJob, PollJobStats, PollState, PollingScheduler,
};
pub use store::{
    queue_counts_sql, InstanceLocator, LiveInstances, PgQueueStateStore, QueueStateCount,
    QueueStateStore,
};
