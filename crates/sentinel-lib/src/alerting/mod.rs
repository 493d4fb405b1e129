//! Alert generation, lifecycle management and notification delivery

mod generator;
mod manager;
pub mod notifier;

pub use generator::{group_anomalies, AlertGenerator, GroupKey};
pub use manager::{
    AlertManager, AlertSummary, AlertingConfig, AlertingReport, ApiAlertCount, DispatchReport,
    LifecycleOutcome, NotificationCache, CACHE_CAPACITY, CACHE_RETAIN, DEFAULT_ALERTING_INTERVAL,
    SYSTEM_ACTOR,
};
