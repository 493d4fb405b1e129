//! Collaborator interfaces for metric retrieval and persistence
//!
//! The analysis scheduler and alert manager only talk to storage through
//! [`MetricSource`] and [`Persistence`]. [`MemoryStore`] implements both
//! on top of concurrent maps; the daemon uses it as its default backend.

use crate::error::StoreError;
use crate::models::{Alert, AlertStatus, Anomaly, ApiSourceConfig, Environment, Metric, Prediction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Samples retained per API before the oldest are dropped
pub const MAX_METRICS_PER_API: usize = 100_000;

/// Processed anomalies older than this are dropped on the next write
pub const DEFAULT_ANOMALY_RETENTION_HOURS: i64 = 24;

pub const MAX_STORED_ANOMALIES: usize = 50_000;
pub const MAX_STORED_PREDICTIONS: usize = 50_000;

/// Bounds applied by [`MemoryStore`] to anomalies and predictions. Alerts are kept.
#[derive(Debug, Clone)]
pub struct Retention {
    pub anomaly_max_age: chrono::Duration,
    /// Only processed anomalies are evicted to stay under this
    pub max_anomalies: usize,
    pub max_predictions: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            anomaly_max_age: chrono::Duration::hours(DEFAULT_ANOMALY_RETENTION_HOURS),
            max_anomalies: MAX_STORED_ANOMALIES,
            max_predictions: MAX_STORED_PREDICTIONS,
        }
    }
}

/// Query over stored metric samples. `api_id: None` spans every API.
#[derive(Debug, Clone)]
pub struct MetricQuery {
    pub api_id: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub environment: Option<Environment>,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    /// Keep only the most recent `limit` samples
    pub limit: Option<usize>,
}

impl MetricQuery {
    pub fn window(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            api_id: None,
            start,
            end,
            environment: None,
            endpoint: None,
            method: None,
            limit: None,
        }
    }

    pub fn for_api(mut self, api_id: impl Into<String>) -> Self {
        self.api_id = Some(api_id.into());
        self
    }

    fn matches(&self, m: &Metric) -> bool {
        m.timestamp >= self.start
            && m.timestamp <= self.end
            && self.api_id.as_ref().map_or(true, |id| &m.api_id == id)
            && self.environment.map_or(true, |env| m.environment == env)
            && self.endpoint.as_ref().map_or(true, |e| &m.endpoint == e)
            && self.method.as_ref().map_or(true, |me| m.method.eq_ignore_ascii_case(me))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnomalyFilter {
    pub since: Option<DateTime<Utc>>,
    pub api_id: Option<String>,
    pub environment: Option<Environment>,
}

impl AnomalyFilter {
    fn matches(&self, a: &Anomaly) -> bool {
        self.since.map_or(true, |s| a.timestamp >= s)
            && self.api_id.as_ref().map_or(true, |id| &a.api_id == id)
            && self.environment.map_or(true, |env| a.environment == env)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PredictionFilter {
    pub api_id: Option<String>,
    pub environment: Option<Environment>,
    pub predicted_after: Option<DateTime<Utc>>,
    pub predicted_before: Option<DateTime<Utc>>,
    pub min_confidence: Option<f64>,
}

impl PredictionFilter {
    fn matches(&self, p: &Prediction) -> bool {
        self.api_id.as_ref().map_or(true, |id| &p.api_id == id)
            && self.environment.map_or(true, |env| p.environment == env)
            && self.predicted_after.map_or(true, |t| p.predicted_for >= t)
            && self.predicted_before.map_or(true, |t| p.predicted_for <= t)
            && self.min_confidence.map_or(true, |c| p.confidence >= c)
    }
}

/// Alert filter. An empty status list matches every status.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub statuses: Vec<AlertStatus>,
    pub api_id: Option<String>,
    pub environment: Option<Environment>,
}

impl AlertFilter {
    pub fn active() -> Self {
        Self {
            statuses: vec![AlertStatus::Open, AlertStatus::Acknowledged],
            ..Default::default()
        }
    }

    fn matches(&self, a: &Alert) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&a.status))
            && self.api_id.as_ref().map_or(true, |id| a.apis.contains(id))
            && self.environment.map_or(true, |env| a.environments.contains(&env))
    }
}

/// Time-ordered metric samples
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Samples matching `query`, ascending by timestamp
    async fn get_metrics(&self, query: &MetricQuery) -> Result<Vec<Metric>, StoreError>;
}

/// Storage for analysis output, alerts and API source configuration
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn store_anomalies(&self, anomalies: &[Anomaly]) -> Result<(), StoreError>;
    async fn store_predictions(&self, predictions: &[Prediction]) -> Result<(), StoreError>;
    async fn get_unprocessed_anomalies(&self) -> Result<Vec<Anomaly>, StoreError>;
    async fn mark_anomalies_processed(&self, ids: &[String]) -> Result<(), StoreError>;
    async fn get_anomalies(&self, filter: &AnomalyFilter) -> Result<Vec<Anomaly>, StoreError>;
    async fn get_predictions(&self, filter: &PredictionFilter)
        -> Result<Vec<Prediction>, StoreError>;

    async fn store_alerts(&self, alerts: &[Alert]) -> Result<(), StoreError>;
    async fn get_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>, StoreError>;
    async fn get_alert(&self, id: &str) -> Result<Option<Alert>, StoreError>;
    /// Set status and actor, returning the updated alert
    async fn update_alert_status(
        &self,
        id: &str,
        status: AlertStatus,
        actor: &str,
    ) -> Result<Alert, StoreError>;
    /// Replace a stored alert wholesale
    async fn update_alert(&self, alert: &Alert) -> Result<(), StoreError>;

    /// Configured APIs, optionally only those changed since a point in time
    async fn get_api_sources(
        &self,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ApiSourceConfig>, StoreError>;
}

/// Await a collaborator call, failing with `StoreError::Timeout` past `limit`
pub async fn call<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

/// In-process implementation of [`MetricSource`] and [`Persistence`]
#[derive(Debug)]
pub struct MemoryStore {
    metrics: DashMap<String, Vec<Metric>>,
    anomalies: DashMap<String, Anomaly>,
    predictions: DashMap<String, Prediction>,
    alerts: DashMap<String, Alert>,
    sources: DashMap<String, ApiSourceConfig>,
    available: AtomicBool,
    retention: Retention,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_retention(Retention::default())
    }

    pub fn with_retention(retention: Retention) -> Self {
        Self {
            metrics: DashMap::new(),
            anomalies: DashMap::new(),
            predictions: DashMap::new(),
            alerts: DashMap::new(),
            sources: DashMap::new(),
            available: AtomicBool::new(true),
            retention,
        }
    }

    /// Toggle availability; while unavailable every operation fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    /// Append samples, keeping each API's series sorted and bounded
    pub fn ingest_metrics(&self, metrics: impl IntoIterator<Item = Metric>) -> Result<usize, StoreError> {
        self.check()?;
        let mut count = 0;
        for metric in metrics {
            let mut series = self.metrics.entry(metric.api_id.clone()).or_default();
            let needs_sort = series.last().map_or(false, |last| last.timestamp > metric.timestamp);
            series.push(metric);
            if needs_sort {
                series.sort_by_key(|m| m.timestamp);
            }
            if series.len() > MAX_METRICS_PER_API {
                let excess = series.len() - MAX_METRICS_PER_API;
                series.drain(0..excess);
            }
            count += 1;
        }
        debug!(count, "Ingested metric samples");
        Ok(count)
    }

    /// Drop stale processed anomalies, then the oldest processed ones over the cap
    fn prune_anomalies(&self) {
        let cutoff = Utc::now() - self.retention.anomaly_max_age;
        self.anomalies.retain(|_, a| !(a.processed && a.timestamp < cutoff));

        let excess = self.anomalies.len().saturating_sub(self.retention.max_anomalies);
        if excess == 0 {
            return;
        }
        let mut processed: Vec<(DateTime<Utc>, String)> = self
            .anomalies
            .iter()
            .filter(|a| a.processed)
            .map(|a| (a.timestamp, a.id.clone()))
            .collect();
        processed.sort();
        for (_, id) in processed.into_iter().take(excess) {
            self.anomalies.remove(&id);
        }
    }

    /// Drop predictions whose target time has passed, then the oldest over the cap
    fn prune_predictions(&self) {
        let now = Utc::now();
        self.predictions.retain(|_, p| p.predicted_for >= now);

        let excess = self.predictions.len().saturating_sub(self.retention.max_predictions);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .predictions
            .iter()
            .map(|p| (p.created_at, p.id.clone()))
            .collect();
        by_age.sort();
        for (_, id) in by_age.into_iter().take(excess) {
            self.predictions.remove(&id);
        }
    }

    pub fn upsert_source(&self, source: ApiSourceConfig) -> Result<(), StoreError> {
        self.check()?;
        self.sources.insert(source.id.clone(), source);
        Ok(())
    }

    pub fn remove_source(&self, id: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.sources.remove(id).is_some())
    }
}

#[async_trait]
impl MetricSource for MemoryStore {
    async fn get_metrics(&self, query: &MetricQuery) -> Result<Vec<Metric>, StoreError> {
        self.check()?;
        let mut out: Vec<Metric> = match &query.api_id {
            Some(id) => self
                .metrics
                .get(id)
                .map(|series| series.iter().filter(|m| query.matches(m)).cloned().collect())
                .unwrap_or_default(),
            None => self
                .metrics
                .iter()
                .flat_map(|entry| {
                    entry
                        .value()
                        .iter()
                        .filter(|m| query.matches(m))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .collect(),
        };
        out.sort_by_key(|m| m.timestamp);
        if let Some(limit) = query.limit {
            if out.len() > limit {
                out.drain(0..out.len() - limit);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn store_anomalies(&self, anomalies: &[Anomaly]) -> Result<(), StoreError> {
        self.check()?;
        for a in anomalies {
            self.anomalies.insert(a.id.clone(), a.clone());
        }
        self.prune_anomalies();
        Ok(())
    }

    async fn store_predictions(&self, predictions: &[Prediction]) -> Result<(), StoreError> {
        self.check()?;
        for p in predictions {
            self.predictions.insert(p.id.clone(), p.clone());
        }
        self.prune_predictions();
        Ok(())
    }

    async fn get_unprocessed_anomalies(&self) -> Result<Vec<Anomaly>, StoreError> {
        self.check()?;
        let mut out: Vec<Anomaly> = self
            .anomalies
            .iter()
            .filter(|a| !a.processed)
            .map(|a| a.value().clone())
            .collect();
        out.sort_by_key(|a| a.timestamp);
        Ok(out)
    }

    async fn mark_anomalies_processed(&self, ids: &[String]) -> Result<(), StoreError> {
        self.check()?;
        for id in ids {
            if let Some(mut a) = self.anomalies.get_mut(id) {
                a.processed = true;
            }
        }
        Ok(())
    }

    async fn get_anomalies(&self, filter: &AnomalyFilter) -> Result<Vec<Anomaly>, StoreError> {
        self.check()?;
        let mut out: Vec<Anomaly> = self
            .anomalies
            .iter()
            .filter(|a| filter.matches(a))
            .map(|a| a.value().clone())
            .collect();
        out.sort_by_key(|a| a.timestamp);
        Ok(out)
    }

    async fn get_predictions(
        &self,
        filter: &PredictionFilter,
    ) -> Result<Vec<Prediction>, StoreError> {
        self.check()?;
        let mut out: Vec<Prediction> = self
            .predictions
            .iter()
            .filter(|p| filter.matches(p))
            .map(|p| p.value().clone())
            .collect();
        out.sort_by_key(|p| p.predicted_for);
        Ok(out)
    }

    async fn store_alerts(&self, alerts: &[Alert]) -> Result<(), StoreError> {
        self.check()?;
        for alert in alerts {
            self.alerts.insert(alert.id.clone(), alert.clone());
        }
        Ok(())
    }

    async fn get_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>, StoreError> {
        self.check()?;
        let mut out: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|a| filter.matches(a))
            .map(|a| a.value().clone())
            .collect();
        // Most severe first, then newest
        out.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(out)
    }

    async fn get_alert(&self, id: &str) -> Result<Option<Alert>, StoreError> {
        self.check()?;
        Ok(self.alerts.get(id).map(|a| a.value().clone()))
    }

    async fn update_alert_status(
        &self,
        id: &str,
        status: AlertStatus,
        actor: &str,
    ) -> Result<Alert, StoreError> {
        self.check()?;
        let mut alert = self.alerts.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "alert",
            id: id.to_string(),
        })?;
        alert.status = status;
        alert.updated_at = Utc::now();
        alert.updated_by = Some(actor.to_string());
        Ok(alert.clone())
    }

    async fn update_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.check()?;
        match self.alerts.get_mut(&alert.id) {
            Some(mut existing) => {
                *existing = alert.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "alert",
                id: alert.id.clone(),
            }),
        }
    }

    async fn get_api_sources(
        &self,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ApiSourceConfig>, StoreError> {
        self.check()?;
        let mut out: Vec<ApiSourceConfig> = self
            .sources
            .iter()
            .filter(|s| updated_since.map_or(true, |t| s.updated_at > t))
            .map(|s| s.value().clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}
