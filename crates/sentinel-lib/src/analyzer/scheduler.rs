//! Periodic analysis over every configured API
//!
//! Each cycle reconciles the analyzer sets against the configured API
//! sources, then fans out detection and prediction for all APIs and the
//! global analyzers concurrently, persisting whatever they produce.

use super::{analyzers_for, global_analyzers, Analyzer};
use crate::health::{components, HealthRegistry};
use crate::models::{Anomaly, ApiSourceConfig, Metric, Prediction};
use crate::observability::{SentinelMetrics, StructuredLogger};
use crate::store::{call, MetricQuery, MetricSource, Persistence};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, info, warn};

pub const DEFAULT_ANALYSIS_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_ANALYSIS_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Samples fetched for prediction; error-rate trends compare two hours
pub const DEFAULT_PREDICTION_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub interval: Duration,
    /// Trailing window handed to anomaly detection
    pub analysis_window: Duration,
    /// Trailing window handed to prediction; never shorter than `analysis_window`
    pub prediction_window: Duration,
    /// Limit for every metric source and persistence call
    pub io_timeout: Duration,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_ANALYSIS_INTERVAL,
            analysis_window: DEFAULT_ANALYSIS_WINDOW,
            prediction_window: DEFAULT_PREDICTION_WINDOW,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

/// Totals from one analysis cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub apis_analyzed: usize,
    pub anomalies: usize,
    pub predictions: usize,
    /// Batches whose fetch or persistence failed
    pub failures: usize,
}

struct ApiAnalyzers {
    updated_at: DateTime<Utc>,
    analyzers: Vec<Box<dyn Analyzer>>,
    /// Newest sample already searched for anomalies
    detected_through: Option<DateTime<Utc>>,
}

/// Collaborators shared by every batch in a cycle
struct CycleContext<'a> {
    source: &'a dyn MetricSource,
    persistence: &'a dyn Persistence,
    logger: &'a StructuredLogger,
    io_timeout: Duration,
    now: DateTime<Utc>,
    detect_from: DateTime<Utc>,
    fetch_from: DateTime<Utc>,
}

/// Output of one batch (one API, or the global analyzers)
#[derive(Default)]
struct BatchOutcome {
    anomalies: usize,
    predictions: usize,
}

pub struct AnalysisScheduler {
    source: Arc<dyn MetricSource>,
    persistence: Arc<dyn Persistence>,
    config: AnalysisConfig,
    apis: HashMap<String, ApiAnalyzers>,
    global: Vec<Box<dyn Analyzer>>,
    global_detected_through: Option<DateTime<Utc>>,
    health: Option<HealthRegistry>,
    metrics: SentinelMetrics,
    logger: StructuredLogger,
}

impl AnalysisScheduler {
    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Ids of APIs that currently have an analyzer set, sorted
    pub fn monitored_apis(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.apis.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run analysis cycles until shutdown. An in-flight cycle always completes.
    pub async fn run(mut self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            window_secs = self.config.analysis_window.as_secs(),
            "Starting analysis scheduler"
        );
        if let Some(health) = &self.health {
            health.register(components::ANALYSIS_SCHEDULER).await;
        }

        let mut ticker = interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    debug!(?report, "Analysis cycle finished");
                }
                _ = shutdown.recv() => {
                    info!("Shutting down analysis scheduler");
                    break;
                }
            }
        }

        for entry in self.apis.values_mut() {
            entry.analyzers.iter_mut().for_each(|a| a.cleanup());
        }
        self.global.iter_mut().for_each(|a| a.cleanup());
    }

    /// One reconcile + analyze pass over every API
    pub async fn run_cycle(&mut self) -> CycleReport {
        let start = Instant::now();
        self.reconcile().await;

        let now = Utc::now();
        let detect_from = now - to_chrono(self.config.analysis_window);
        let fetch_from = now
            - to_chrono(
                self.config
                    .prediction_window
                    .max(self.config.analysis_window),
            );
        let ctx = CycleContext {
            source: self.source.as_ref(),
            persistence: self.persistence.as_ref(),
            logger: &self.logger,
            io_timeout: self.config.io_timeout,
            now,
            detect_from,
            fetch_from,
        };

        let per_api = join_all(
            self.apis
                .iter_mut()
                .map(|(api_id, entry)| {
                    analyze_batch(
                        &ctx,
                        Some(api_id.as_str()),
                        &mut entry.analyzers,
                        &mut entry.detected_through,
                    )
                }),
        );
        let global = analyze_batch(
            &ctx,
            None,
            &mut self.global,
            &mut self.global_detected_through,
        );
        let (per_api, global) = tokio::join!(per_api, global);

        let mut report = CycleReport {
            apis_analyzed: per_api.len(),
            ..Default::default()
        };
        let mut fetch_failed = false;
        let mut store_failed = false;
        for outcome in per_api.into_iter().chain(std::iter::once(global)) {
            match outcome {
                Ok(batch) => {
                    report.anomalies += batch.anomalies;
                    report.predictions += batch.predictions;
                }
                Err(BatchError::Fetch) => {
                    fetch_failed = true;
                    report.failures += 1;
                }
                Err(BatchError::Store) => {
                    store_failed = true;
                    report.failures += 1;
                }
            }
        }

        self.metrics.add_anomalies(report.anomalies);
        self.metrics.add_predictions(report.predictions);
        self.metrics.set_monitored_apis(self.apis.len());
        (0..report.failures).for_each(|_| self.metrics.inc_cycle_errors());
        self.metrics.observe_analysis_cycle(start.elapsed().as_secs_f64());

        if let Some(health) = &self.health {
            let source_state: Result<(), &str> = if fetch_failed {
                Err("metric fetch failed during the last analysis cycle")
            } else {
                Ok(())
            };
            health.record(components::METRIC_SOURCE, &source_state).await;
            if store_failed {
                health
                    .set_degraded(components::PERSISTENCE, "failed to persist analysis results")
                    .await;
            }
            health.set_healthy(components::ANALYSIS_SCHEDULER).await;
        }

        info!(
            apis = report.apis_analyzed,
            anomalies = report.anomalies,
            predictions = report.predictions,
            failures = report.failures,
            duration_ms = start.elapsed().as_millis() as u64,
            "Analysis cycle complete"
        );
        report
    }

    /// Bring the analyzer sets in line with the configured sources
    async fn reconcile(&mut self) {
        let sources = match call(self.config.io_timeout, self.persistence.get_api_sources(None)).await {
            Ok(sources) => sources,
            Err(e) => {
                warn!(error = %e, "Failed to load API sources, keeping current analyzers");
                if let Some(health) = &self.health {
                    health.set_degraded(components::PERSISTENCE, e.to_string()).await;
                }
                return;
            }
        };

        let active: HashMap<&str, &ApiSourceConfig> = sources
            .iter()
            .filter(|s| s.is_active)
            .map(|s| (s.id.as_str(), s))
            .collect();

        self.apis.retain(|id, entry| {
            let keep = active.contains_key(id.as_str());
            if !keep {
                entry.analyzers.iter_mut().for_each(|a| a.cleanup());
                info!(api_id = %id, "Removed analyzers for deleted or inactive API");
            }
            keep
        });

        for (id, source) in active {
            match self.apis.get_mut(id) {
                Some(entry) if entry.updated_at != source.updated_at => {
                    entry.analyzers.iter_mut().for_each(|a| a.update_config(source));
                    entry.updated_at = source.updated_at;
                    info!(api_id = %id, "Applied updated API configuration");
                }
                Some(_) => {}
                None => {
                    self.apis.insert(
                        id.to_string(),
                        ApiAnalyzers {
                            updated_at: source.updated_at,
                            analyzers: analyzers_for(source),
                            detected_through: None,
                        },
                    );
                    info!(api_id = %id, name = %source.name, "Created analyzers for API");
                }
            }
        }
    }
}

/// Which collaborator a batch failed on; the cause is logged where it occurs
enum BatchError {
    Fetch,
    Store,
}

/// Fetch one batch of samples, run every analyzer over it, and persist the
/// results. `api_id: None` fetches across all APIs.
///
/// Anomalies at or before `detected_through` were reported by an earlier
/// cycle and are dropped; the mark advances once results are stored.
async fn analyze_batch(
    ctx: &CycleContext<'_>,
    api_id: Option<&str>,
    analyzers: &mut [Box<dyn Analyzer>],
    detected_through: &mut Option<DateTime<Utc>>,
) -> Result<BatchOutcome, BatchError> {
    let label = api_id.unwrap_or("*");
    let mut query = MetricQuery::window(ctx.fetch_from, ctx.now);
    query.api_id = api_id.map(str::to_string);

    let metrics = call(ctx.io_timeout, ctx.source.get_metrics(&query))
        .await
        .map_err(|e| {
            warn!(api_id = %label, error = %e, "Failed to fetch metrics");
            BatchError::Fetch
        })?;
    if metrics.is_empty() {
        debug!(api_id = %label, "No metrics in window");
        return Ok(BatchOutcome::default());
    }

    let first_recent = metrics.partition_point(|m| m.timestamp < ctx.detect_from);
    let recent: &[Metric] = &metrics[first_recent..];

    let mut anomalies: Vec<Anomaly> = Vec::new();
    let mut predictions: Vec<Prediction> = Vec::new();
    for analyzer in analyzers.iter_mut() {
        anomalies.extend(analyzer.detect_anomalies(recent));
        predictions.extend(analyzer.predict_issues(&metrics));
    }
    if let Some(mark) = *detected_through {
        let before = anomalies.len();
        anomalies.retain(|a| a.timestamp > mark);
        if anomalies.len() < before {
            debug!(api_id = %label, dropped = before - anomalies.len(), "Dropped anomalies already reported");
        }
    }

    if !anomalies.is_empty() {
        call(ctx.io_timeout, ctx.persistence.store_anomalies(&anomalies))
            .await
            .map_err(|e| {
                warn!(api_id = %label, error = %e, count = anomalies.len(), "Failed to store anomalies");
                BatchError::Store
            })?;
        anomalies.iter().for_each(|a| ctx.logger.log_anomaly(a));
    }
    if !predictions.is_empty() {
        call(ctx.io_timeout, ctx.persistence.store_predictions(&predictions))
            .await
            .map_err(|e| {
                warn!(api_id = %label, error = %e, count = predictions.len(), "Failed to store predictions");
                BatchError::Store
            })?;
        predictions.iter().for_each(|p| ctx.logger.log_prediction(p));
    }

    *detected_through = recent.last().map(|m| m.timestamp).max(*detected_through);

    Ok(BatchOutcome {
        anomalies: anomalies.len(),
        predictions: predictions.len(),
    })
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::hours(1))
}

/// Builder for the analysis scheduler
pub struct AnalysisSchedulerBuilder {
    source: Option<Arc<dyn MetricSource>>,
    persistence: Option<Arc<dyn Persistence>>,
    config: AnalysisConfig,
    health: Option<HealthRegistry>,
    instance: String,
}

impl AnalysisSchedulerBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            persistence: None,
            config: AnalysisConfig::default(),
            health: None,
            instance: "api-sentinel".to_string(),
        }
    }

    pub fn source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn config(mut self, config: AnalysisConfig) -> Self {
        self.config = config;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn analysis_window(mut self, window: Duration) -> Self {
        self.config.analysis_window = window;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn build(self) -> anyhow::Result<AnalysisScheduler> {
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Metric source is required"))?;
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("Persistence is required"))?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Analysis interval must be positive");
        }

        Ok(AnalysisScheduler {
            source,
            persistence,
            config: self.config,
            apis: HashMap::new(),
            global: global_analyzers(),
            global_detected_through: None,
            health: self.health,
            metrics: SentinelMetrics::new(),
            logger: StructuredLogger::new(self.instance),
        })
    }
}

impl Default for AnalysisSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
