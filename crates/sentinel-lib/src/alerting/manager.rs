//! Alert lifecycle, periodic alert generation and notification dispatch

use super::generator::{group_anomalies, AlertGenerator};
use super::notifier::NotificationChannel;
use crate::error::{AlertError, StoreError};
use crate::health::{components, HealthRegistry};
use crate::models::{Alert, AlertSeverity, AlertStatus, Environment};
use crate::observability::{SentinelMetrics, StructuredLogger};
use crate::store::{call, AlertFilter, AnomalyFilter, Persistence, PredictionFilter};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

pub const DEFAULT_ALERTING_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Notified ids kept before trimming
pub const CACHE_CAPACITY: usize = 1000;
/// Ids kept (most recent) after a trim
pub const CACHE_RETAIN: usize = 500;

/// Predictions at or above this confidence count as upcoming in summaries
pub const SUMMARY_MIN_CONFIDENCE: f64 = 0.7;
pub const SUMMARY_TOP_APIS: usize = 5;

/// Actor recorded when snoozed alerts reopen on their own
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone)]
pub struct AlertingConfig {
    pub interval: Duration,
    pub io_timeout: Duration,
    /// Reopen snoozed alerts once their snooze has expired
    pub auto_resume_snoozed: bool,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_ALERTING_INTERVAL,
            io_timeout: DEFAULT_IO_TIMEOUT,
            auto_resume_snoozed: false,
        }
    }
}

/// Insertion-ordered set of alert ids that have already been notified
#[derive(Debug, Default)]
pub struct NotificationCache {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl NotificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Returns false if the id was already present
    pub fn insert(&mut self, id: String) -> bool {
        if !self.members.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > CACHE_CAPACITY {
            while self.order.len() > CACHE_RETAIN {
                if let Some(old) = self.order.pop_front() {
                    self.members.remove(&old);
                }
            }
        }
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        self.order.retain(|existing| existing != id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Totals from one alerting cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertingReport {
    pub anomalies_processed: usize,
    pub alerts_created: usize,
    pub notifications_sent: usize,
    pub notifications_failed: usize,
    pub snoozes_resumed: usize,
}

/// Per-alert dispatch result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

/// Result of a lifecycle operation
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleOutcome {
    Applied(Alert),
    /// Persistence was unavailable; nothing changed
    Skipped,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ApiAlertCount {
    pub api_id: String,
    pub active_alerts: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AlertSummary {
    pub active_alerts: usize,
    pub by_severity: BTreeMap<AlertSeverity, usize>,
    pub recent_anomalies: usize,
    pub upcoming_predictions: usize,
    pub environments: Vec<Environment>,
    pub top_apis: Vec<ApiAlertCount>,
}

pub struct AlertManager {
    persistence: Arc<dyn Persistence>,
    generator: AlertGenerator,
    channels: Vec<Arc<dyn NotificationChannel>>,
    cache: Mutex<NotificationCache>,
    config: AlertingConfig,
    health: Option<HealthRegistry>,
    metrics: SentinelMetrics,
    logger: StructuredLogger,
}

impl AlertManager {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        channels: Vec<Arc<dyn NotificationChannel>>,
        config: AlertingConfig,
    ) -> Self {
        Self {
            persistence,
            generator: AlertGenerator::new(),
            channels,
            cache: Mutex::new(NotificationCache::new()),
            config,
            health: None,
            metrics: SentinelMetrics::new(),
            logger: StructuredLogger::new("api-sentinel"),
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.logger = StructuredLogger::new(instance);
        self
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Run alerting cycles until shutdown. An in-flight cycle always completes.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            channels = self.channels.len(),
            "Starting alert manager"
        );
        if let Some(health) = &self.health {
            health.register(components::ALERT_MANAGER).await;
        }

        let mut ticker = interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    debug!(?report, "Alerting cycle finished");
                }
                _ = shutdown.recv() => {
                    info!("Shutting down alert manager");
                    break;
                }
            }
        }
    }

    /// Turn unprocessed anomalies into alerts and notify on the severe ones
    pub async fn run_cycle(&self) -> AlertingReport {
        let start = Instant::now();
        let mut report = AlertingReport::default();

        if !self.persistence.is_available().await {
            warn!("Persistence unavailable, skipping alert processing");
            self.set_persistence_health(Err("unavailable")).await;
            return report;
        }

        if self.config.auto_resume_snoozed {
            report.snoozes_resumed = self.resume_expired_snoozes(Utc::now()).await;
        }

        let anomalies = match call(self.config.io_timeout, self.persistence.get_unprocessed_anomalies()).await {
            Ok(anomalies) => anomalies,
            Err(e) => {
                warn!(error = %e, "Failed to load unprocessed anomalies");
                self.fail_cycle(&e).await;
                return report;
            }
        };
        if anomalies.is_empty() {
            self.finish_cycle(start).await;
            return report;
        }

        let ids: Vec<String> = anomalies.iter().map(|a| a.id.clone()).collect();
        let alerts = self.generator.generate_alerts(&group_anomalies(anomalies));

        if let Err(e) = call(self.config.io_timeout, self.persistence.store_alerts(&alerts)).await {
            warn!(error = %e, count = alerts.len(), "Failed to store alerts, anomalies stay unprocessed");
            self.fail_cycle(&e).await;
            return report;
        }
        report.anomalies_processed = ids.len();
        report.alerts_created = alerts.len();
        self.metrics.add_alerts(alerts.len());
        alerts.iter().for_each(|a| self.logger.log_alert(a));

        if let Err(e) = call(self.config.io_timeout, self.persistence.mark_anomalies_processed(&ids)).await {
            warn!(error = %e, count = ids.len(), "Failed to mark anomalies processed");
            self.metrics.inc_cycle_errors();
        }

        let dispatches = join_all(alerts.iter().map(|a| self.notify_alert(a))).await;
        for d in dispatches {
            report.notifications_sent += d.sent;
            report.notifications_failed += d.failed;
        }

        info!(
            anomalies = report.anomalies_processed,
            alerts = report.alerts_created,
            notifications_sent = report.notifications_sent,
            notifications_failed = report.notifications_failed,
            "Alerting cycle complete"
        );
        self.finish_cycle(start).await;
        report
    }

    /// Send a high or critical alert to every channel once per cache lifetime
    pub async fn notify_alert(&self, alert: &Alert) -> DispatchReport {
        if !alert.severity.is_notifiable() || self.channels.is_empty() {
            return DispatchReport::default();
        }
        if !self.cache.lock().await.insert(alert.id.clone()) {
            debug!(alert_id = %alert.id, "Alert already notified");
            return DispatchReport::default();
        }

        let results = join_all(
            self.channels
                .iter()
                .map(|channel| async move { (channel.name(), channel.send_alert(alert).await) }),
        )
        .await;

        let mut report = DispatchReport::default();
        for (channel, delivered) in results {
            self.metrics.record_notification(channel, delivered);
            if delivered {
                report.sent += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    pub async fn acknowledge(&self, id: &str, actor: &str) -> Result<LifecycleOutcome, AlertError> {
        self.transition(id, AlertStatus::Acknowledged, actor, None).await
    }

    pub async fn resolve(&self, id: &str, actor: &str) -> Result<LifecycleOutcome, AlertError> {
        let outcome = self.transition(id, AlertStatus::Resolved, actor, None).await?;
        if matches!(outcome, LifecycleOutcome::Applied(_)) {
            self.cache.lock().await.remove(id);
        }
        Ok(outcome)
    }

    /// Snooze for `duration_minutes`; the resume time is kept in metadata
    pub async fn snooze(
        &self,
        id: &str,
        duration_minutes: i64,
        actor: &str,
    ) -> Result<LifecycleOutcome, AlertError> {
        if duration_minutes <= 0 {
            return Err(AlertError::InvalidArgument(format!(
                "snooze duration must be positive, got {duration_minutes} minutes"
            )));
        }
        let until = ChronoDuration::try_minutes(duration_minutes)
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or_else(|| {
                AlertError::InvalidArgument(format!(
                    "snooze duration of {duration_minutes} minutes is out of range"
                ))
            })?;
        let outcome = self
            .transition(id, AlertStatus::Snoozed, actor, Some((until, duration_minutes)))
            .await?;
        if matches!(outcome, LifecycleOutcome::Applied(_)) {
            self.cache.lock().await.remove(id);
            info!(alert_id = %id, duration_minutes, actor = %actor, "Alert snoozed");
        }
        Ok(outcome)
    }

    /// Open and acknowledged alerts, optionally narrowed to an API or environment
    pub async fn get_active_alerts(
        &self,
        api_id: Option<&str>,
        environment: Option<Environment>,
    ) -> Vec<Alert> {
        if !self.persistence.is_available().await {
            warn!("Persistence unavailable, cannot list active alerts");
            return Vec::new();
        }
        let filter = AlertFilter {
            api_id: api_id.map(str::to_string),
            environment,
            ..AlertFilter::active()
        };
        match call(self.config.io_timeout, self.persistence.get_alerts(&filter)).await {
            Ok(alerts) => alerts,
            Err(e) => {
                warn!(error = %e, "Failed to load active alerts");
                Vec::new()
            }
        }
    }

    pub async fn summary(
        &self,
        api_id: Option<&str>,
        environment: Option<Environment>,
    ) -> Result<AlertSummary, AlertError> {
        let active = self.get_active_alerts(api_id, environment).await;
        let now = Utc::now();

        let anomaly_filter = AnomalyFilter {
            since: Some(now - ChronoDuration::hours(1)),
            api_id: api_id.map(str::to_string),
            environment,
        };
        let prediction_filter = PredictionFilter {
            api_id: api_id.map(str::to_string),
            environment,
            predicted_after: Some(now),
            predicted_before: Some(now + ChronoDuration::hours(24)),
            min_confidence: Some(SUMMARY_MIN_CONFIDENCE),
        };
        let (anomalies, predictions) = tokio::join!(
            call(self.config.io_timeout, self.persistence.get_anomalies(&anomaly_filter)),
            call(self.config.io_timeout, self.persistence.get_predictions(&prediction_filter)),
        );
        let anomalies = anomalies.map_err(|e| operation_failed("summary", &e))?;
        let predictions = predictions.map_err(|e| operation_failed("summary", &e))?;

        let mut by_severity: BTreeMap<AlertSeverity, usize> = [
            AlertSeverity::Critical,
            AlertSeverity::High,
            AlertSeverity::Medium,
            AlertSeverity::Low,
        ]
        .into_iter()
        .map(|s| (s, 0))
        .collect();
        let mut per_api: BTreeMap<&str, usize> = BTreeMap::new();
        let mut environments = BTreeSet::new();
        for alert in &active {
            *by_severity.entry(alert.severity).or_default() += 1;
            for api in &alert.apis {
                *per_api.entry(api.as_str()).or_default() += 1;
            }
            environments.extend(alert.environments.iter().copied());
        }

        let mut top_apis: Vec<ApiAlertCount> = per_api
            .into_iter()
            .map(|(api_id, active_alerts)| ApiAlertCount {
                api_id: api_id.to_string(),
                active_alerts,
            })
            .collect();
        // Stable sort keeps ties in id order
        top_apis.sort_by(|a, b| b.active_alerts.cmp(&a.active_alerts));
        top_apis.truncate(SUMMARY_TOP_APIS);

        Ok(AlertSummary {
            active_alerts: active.len(),
            by_severity,
            recent_anomalies: anomalies.len(),
            upcoming_predictions: predictions.len(),
            environments: environments.into_iter().collect(),
            top_apis,
        })
    }

    async fn transition(
        &self,
        id: &str,
        to: AlertStatus,
        actor: &str,
        snooze: Option<(DateTime<Utc>, i64)>,
    ) -> Result<LifecycleOutcome, AlertError> {
        if !self.persistence.is_available().await {
            warn!(alert_id = %id, to = %to, "Persistence unavailable, alert not updated");
            return Ok(LifecycleOutcome::Skipped);
        }

        let current = call(self.config.io_timeout, self.persistence.get_alert(id))
            .await
            .map_err(|e| operation_failed("load alert", &e))?
            .ok_or_else(|| AlertError::NotFound(id.to_string()))?;
        let from = current.status;
        if !from.can_transition_to(to) {
            return Err(AlertError::InvalidTransition { from, to });
        }

        let updated = match snooze {
            Some((until, minutes)) => {
                let mut alert = current;
                alert.status = to;
                alert.updated_at = Utc::now();
                alert.updated_by = Some(actor.to_string());
                alert.metadata.insert("snooze_until".to_string(), json!(until.to_rfc3339()));
                alert.metadata.insert("snoozed_by".to_string(), json!(actor));
                alert.metadata.insert("snooze_duration_minutes".to_string(), json!(minutes));
                call(self.config.io_timeout, self.persistence.update_alert(&alert))
                    .await
                    .map_err(|e| store_failure(id, e))?;
                alert
            }
            None => call(
                self.config.io_timeout,
                self.persistence.update_alert_status(id, to, actor),
            )
            .await
            .map_err(|e| store_failure(id, e))?,
        };

        self.logger.log_transition(id, from, to, actor);
        Ok(LifecycleOutcome::Applied(updated))
    }

    /// Reopen snoozed alerts whose resume time has passed
    async fn resume_expired_snoozes(&self, now: DateTime<Utc>) -> usize {
        let filter = AlertFilter {
            statuses: vec![AlertStatus::Snoozed],
            ..Default::default()
        };
        let snoozed = match call(self.config.io_timeout, self.persistence.get_alerts(&filter)).await {
            Ok(alerts) => alerts,
            Err(e) => {
                warn!(error = %e, "Failed to load snoozed alerts");
                return 0;
            }
        };

        let mut resumed = 0;
        for alert in snoozed {
            let expired = alert
                .metadata
                .get("snooze_until")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .is_some_and(|until| until.with_timezone(&Utc) <= now);
            if !expired {
                continue;
            }
            match call(
                self.config.io_timeout,
                self.persistence
                    .update_alert_status(&alert.id, AlertStatus::Open, SYSTEM_ACTOR),
            )
            .await
            {
                Ok(_) => {
                    self.logger
                        .log_transition(&alert.id, AlertStatus::Snoozed, AlertStatus::Open, SYSTEM_ACTOR);
                    resumed += 1;
                }
                Err(e) => warn!(alert_id = %alert.id, error = %e, "Failed to resume snoozed alert"),
            }
        }
        resumed
    }

    async fn fail_cycle(&self, e: &StoreError) {
        self.metrics.inc_cycle_errors();
        self.set_persistence_health(Err(&e.to_string())).await;
    }

    async fn finish_cycle(&self, start: Instant) {
        self.metrics.observe_alerting_cycle(start.elapsed().as_secs_f64());
        self.set_persistence_health(Ok(())).await;
        if let Some(health) = &self.health {
            health.set_healthy(components::ALERT_MANAGER).await;
        }
    }

    async fn set_persistence_health(&self, state: Result<(), &str>) {
        if let Some(health) = &self.health {
            health.record(components::PERSISTENCE, &state).await;
        }
    }
}

fn store_failure(id: &str, e: StoreError) -> AlertError {
    match e {
        StoreError::NotFound { .. } => AlertError::NotFound(id.to_string()),
        other => operation_failed("update alert", &other),
    }
}

fn operation_failed(operation: &str, e: &StoreError) -> AlertError {
    error!(operation, error = %e, "Alert operation failed");
    AlertError::OperationFailed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotifyError;
    use crate::models::{anomaly_types, Anomaly, ApiSourceConfig, Prediction, Trend};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingChannel {
        name: &'static str,
        delivered: AtomicUsize,
        fail: bool,
    }

    impl CountingChannel {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                delivered: AtomicUsize::new(0),
                fail,
            })
        }

        fn count(&self) -> usize {
            self.delivered.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NotificationChannel for CountingChannel {
        fn name(&self) -> &str {
            self.name
        }

        async fn deliver(&self, _alert: &Alert) -> Result<(), NotifyError> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(NotifyError::Status(502))
            } else {
                Ok(())
            }
        }
    }

    /// Delegates to a MemoryStore but can refuse alert writes
    struct FlakyStore {
        inner: MemoryStore,
        fail_alert_writes: AtomicBool,
    }

    #[async_trait]
    impl Persistence for FlakyStore {
        async fn is_available(&self) -> bool {
            self.inner.is_available().await
        }
        async fn store_anomalies(&self, anomalies: &[Anomaly]) -> Result<(), StoreError> {
            self.inner.store_anomalies(anomalies).await
        }
        async fn store_predictions(&self, predictions: &[Prediction]) -> Result<(), StoreError> {
            self.inner.store_predictions(predictions).await
        }
        async fn get_unprocessed_anomalies(&self) -> Result<Vec<Anomaly>, StoreError> {
            self.inner.get_unprocessed_anomalies().await
        }
        async fn mark_anomalies_processed(&self, ids: &[String]) -> Result<(), StoreError> {
            self.inner.mark_anomalies_processed(ids).await
        }
        async fn get_anomalies(&self, filter: &AnomalyFilter) -> Result<Vec<Anomaly>, StoreError> {
            self.inner.get_anomalies(filter).await
        }
        async fn get_predictions(
            &self,
            filter: &PredictionFilter,
        ) -> Result<Vec<Prediction>, StoreError> {
            self.inner.get_predictions(filter).await
        }
        async fn store_alerts(&self, alerts: &[Alert]) -> Result<(), StoreError> {
            if self.fail_alert_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.inner.store_alerts(alerts).await
        }
        async fn get_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>, StoreError> {
            self.inner.get_alerts(filter).await
        }
        async fn get_alert(&self, id: &str) -> Result<Option<Alert>, StoreError> {
            self.inner.get_alert(id).await
        }
        async fn update_alert_status(
            &self,
            id: &str,
            status: AlertStatus,
            actor: &str,
        ) -> Result<Alert, StoreError> {
            self.inner.update_alert_status(id, status, actor).await
        }
        async fn update_alert(&self, alert: &Alert) -> Result<(), StoreError> {
            self.inner.update_alert(alert).await
        }
        async fn get_api_sources(
            &self,
            updated_since: Option<DateTime<Utc>>,
        ) -> Result<Vec<ApiSourceConfig>, StoreError> {
            self.inner.get_api_sources(updated_since).await
        }
    }

    fn anomaly(api: &str, kind: &str, severity: f64) -> Anomaly {
        Anomaly::new(api, kind, severity, Utc::now(), Environment::Aws, 1.0)
            .with_description("test anomaly")
    }

    fn manager(store: Arc<dyn Persistence>, channels: Vec<Arc<dyn NotificationChannel>>) -> AlertManager {
        AlertManager::new(store, channels, AlertingConfig::default())
    }

    async fn stored_alert(store: &MemoryStore, severity: f64) -> Alert {
        let groups = group_anomalies(vec![anomaly("orders", anomaly_types::HIGH_ERROR_RATE, severity)]);
        let alert = AlertGenerator::new().generate_alerts(&groups).remove(0);
        store.store_alerts(&[alert.clone()]).await.unwrap();
        alert
    }

    #[test]
    fn test_cache_trims_to_most_recent() {
        let mut cache = NotificationCache::new();
        for i in 0..=CACHE_CAPACITY {
            assert!(cache.insert(format!("a{i}")));
        }
        assert_eq!(cache.len(), CACHE_RETAIN);
        assert!(!cache.contains("a0"));
        assert!(cache.contains(&format!("a{CACHE_CAPACITY}")));
        assert!(!cache.insert(format!("a{CACHE_CAPACITY}")));
        assert!(cache.remove(&format!("a{CACHE_CAPACITY}")));
        assert_eq!(cache.len(), CACHE_RETAIN - 1);
    }

    #[tokio::test]
    async fn test_cycle_creates_one_alert_per_group_and_notifies() {
        let store = Arc::new(MemoryStore::new());
        store
            .store_anomalies(&[
                anomaly("A", anomaly_types::HIGH_ERROR_RATE, 0.5),
                anomaly("A", anomaly_types::HIGH_ERROR_RATE, 0.95),
                anomaly("B", anomaly_types::HIGH_ERROR_RATE, 0.2),
            ])
            .await
            .unwrap();
        let webhook = CountingChannel::new("webhook", false);
        let manager = manager(store.clone(), vec![webhook.clone()]);

        let report = manager.run_cycle().await;
        assert_eq!(report.anomalies_processed, 3);
        assert_eq!(report.alerts_created, 2);
        assert_eq!(report.notifications_sent, 1);
        assert_eq!(webhook.count(), 1);
        assert!(store.get_unprocessed_anomalies().await.unwrap().is_empty());

        // Same batch again: nothing new
        let again = manager.run_cycle().await;
        assert_eq!(again, AlertingReport::default());
        assert_eq!(store.get_alerts(&AlertFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_alert_write_keeps_anomalies_unprocessed() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_alert_writes: AtomicBool::new(true),
        });
        store
            .store_anomalies(&[anomaly("A", anomaly_types::RESPONSE_TIME_SPIKE, 0.95)])
            .await
            .unwrap();
        let webhook = CountingChannel::new("webhook", false);
        let manager = manager(store.clone(), vec![webhook.clone()]);

        let report = manager.run_cycle().await;
        assert_eq!(report.alerts_created, 0);
        assert_eq!(webhook.count(), 0);
        assert_eq!(store.get_unprocessed_anomalies().await.unwrap().len(), 1);

        store.fail_alert_writes.store(false, Ordering::SeqCst);
        let report = manager.run_cycle().await;
        assert_eq!(report.alerts_created, 1);
        assert_eq!(webhook.count(), 1);
    }

    #[tokio::test]
    async fn test_dedup_and_channel_failures() {
        let store = Arc::new(MemoryStore::new());
        let ok = CountingChannel::new("webhook", false);
        let broken = CountingChannel::new("email", true);
        let manager = manager(store.clone(), vec![ok.clone(), broken.clone()]);
        let alert = stored_alert(&store, 0.95).await;

        let first = manager.notify_alert(&alert).await;
        assert_eq!(first, DispatchReport { sent: 1, failed: 1 });
        let second = manager.notify_alert(&alert).await;
        assert_eq!(second, DispatchReport::default());
        assert_eq!(ok.count(), 1);
        assert_eq!(broken.count(), 1);
    }

    #[tokio::test]
    async fn test_low_severity_is_not_notified() {
        let store = Arc::new(MemoryStore::new());
        let webhook = CountingChannel::new("webhook", false);
        let manager = manager(store.clone(), vec![webhook.clone()]);
        let alert = stored_alert(&store, 0.5).await;
        assert_eq!(manager.notify_alert(&alert).await, DispatchReport::default());
        assert_eq!(webhook.count(), 0);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone(), Vec::new());
        let alert = stored_alert(&store, 0.8).await;

        let acked = manager.acknowledge(&alert.id, "alice").await.unwrap();
        match acked {
            LifecycleOutcome::Applied(a) => {
                assert_eq!(a.status, AlertStatus::Acknowledged);
                assert_eq!(a.updated_by.as_deref(), Some("alice"));
            }
            LifecycleOutcome::Skipped => panic!("store is available"),
        }
        let err = manager.snooze(&alert.id, 30, "alice").await.unwrap_err();
        assert!(matches!(
            err,
            AlertError::InvalidTransition {
                from: AlertStatus::Acknowledged,
                to: AlertStatus::Snoozed
            }
        ));

        manager.resolve(&alert.id, "bob").await.unwrap();
        let err = manager.acknowledge(&alert.id, "bob").await.unwrap_err();
        assert!(matches!(err, AlertError::InvalidTransition { .. }));

        let err = manager.resolve("missing", "bob").await.unwrap_err();
        assert!(matches!(err, AlertError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_snooze_hides_alert_and_resets_dedup() {
        let store = Arc::new(MemoryStore::new());
        let webhook = CountingChannel::new("webhook", false);
        let manager = manager(store.clone(), vec![webhook.clone()]);
        let alert = stored_alert(&store, 0.95).await;
        manager.notify_alert(&alert).await;
        assert_eq!(manager.get_active_alerts(None, None).await.len(), 1);

        assert!(matches!(
            manager.snooze(&alert.id, 0, "ops").await,
            Err(AlertError::InvalidArgument(_))
        ));
        let outcome = manager.snooze(&alert.id, 45, "ops").await.unwrap();
        let LifecycleOutcome::Applied(snoozed) = outcome else {
            panic!("store is available");
        };
        assert_eq!(snoozed.status, AlertStatus::Snoozed);
        assert_eq!(snoozed.metadata["snoozed_by"], "ops");
        assert_eq!(snoozed.metadata["snooze_duration_minutes"], 45);
        assert!(snoozed.metadata.contains_key("snooze_until"));
        assert!(manager.get_active_alerts(None, None).await.is_empty());

        // Removed from the cache, so it can be notified again
        manager.notify_alert(&alert).await;
        assert_eq!(webhook.count(), 2);
    }

    #[tokio::test]
    async fn test_out_of_range_snooze_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone(), Vec::new());
        let alert = stored_alert(&store, 0.95).await;

        for minutes in [10_000_000_000_000, i64::MAX] {
            assert!(matches!(
                manager.snooze(&alert.id, minutes, "ops").await,
                Err(AlertError::InvalidArgument(_))
            ));
        }
        assert_eq!(manager.get_active_alerts(None, None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_persistence_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone(), Vec::new());
        let alert = stored_alert(&store, 0.95).await;
        store.set_available(false);

        assert_eq!(
            manager.acknowledge(&alert.id, "ops").await.unwrap(),
            LifecycleOutcome::Skipped
        );
        assert!(manager.get_active_alerts(None, None).await.is_empty());
        assert_eq!(manager.run_cycle().await, AlertingReport::default());

        store.set_available(true);
        let current = store.get_alert(&alert.id).await.unwrap().unwrap();
        assert_eq!(current.status, AlertStatus::Open);
    }

    #[tokio::test]
    async fn test_expired_snoozes_resume_when_enabled() {
        let store = Arc::new(MemoryStore::new());
        let config = AlertingConfig {
            auto_resume_snoozed: true,
            ..Default::default()
        };
        let manager = AlertManager::new(store.clone(), Vec::new(), config);
        let alert = stored_alert(&store, 0.8).await;
        manager.snooze(&alert.id, 10, "ops").await.unwrap();

        let mut snoozed = store.get_alert(&alert.id).await.unwrap().unwrap();
        let past = Utc::now() - ChronoDuration::minutes(1);
        snoozed.metadata.insert("snooze_until".to_string(), json!(past.to_rfc3339()));
        store.update_alert(&snoozed).await.unwrap();

        let report = manager.run_cycle().await;
        assert_eq!(report.snoozes_resumed, 1);
        let current = store.get_alert(&alert.id).await.unwrap().unwrap();
        assert_eq!(current.status, AlertStatus::Open);
        assert_eq!(current.updated_by.as_deref(), Some(SYSTEM_ACTOR));
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone(), Vec::new());
        stored_alert(&store, 0.95).await;
        stored_alert(&store, 0.5).await;
        store
            .store_anomalies(&[anomaly("orders", anomaly_types::HIGH_ERROR_RATE, 0.3)])
            .await
            .unwrap();
        let soon = Prediction::new(
            "orders",
            "error_rate",
            0.8,
            Utc::now() + ChronoDuration::hours(1),
            0.2,
            0.1,
            Trend::Increasing,
            Environment::Aws,
        );
        let unlikely = Prediction {
            confidence: 0.5,
            id: "p2".to_string(),
            ..soon.clone()
        };
        store.store_predictions(&[soon, unlikely]).await.unwrap();

        let summary = manager.summary(None, None).await.unwrap();
        assert_eq!(summary.active_alerts, 2);
        assert_eq!(summary.by_severity[&AlertSeverity::Critical], 1);
        assert_eq!(summary.by_severity[&AlertSeverity::Medium], 1);
        assert_eq!(summary.by_severity[&AlertSeverity::Low], 0);
        assert_eq!(summary.recent_anomalies, 1);
        assert_eq!(summary.upcoming_predictions, 1);
        assert_eq!(summary.environments, vec![Environment::Aws]);
        assert_eq!(
            summary.top_apis,
            vec![ApiAlertCount {
                api_id: "orders".to_string(),
                active_alerts: 2
            }]
        );
    }
}
