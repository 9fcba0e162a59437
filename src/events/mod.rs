pub mod fan_out;
pub mod notification;
pub mod registry;
pub mod schema;

// Re-export key types for convenience
pub use fan_out::{
    attach_queue_limit_proxy, fan_out_queue_limits, queue_limit_proxy_event,
    supervisor_init_event,
};
pub use notification::{Measurements, Notification, NotificationName};
pub use registry::{
    handler, DispatchReport, EventRegistry, Handler, RegistryStats, SubscriptionDetail,
};
pub use schema::{
    CircuitMetadata, InitQueuesMetadata, InstanceScoped, JobMetadata, QueueLengthMetadata,
    QueueLimitMetadata, QueueList, QueueOptions, SupervisorConfig, SupervisorInitMetadata,
};
