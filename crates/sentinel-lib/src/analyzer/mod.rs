//! Anomaly detection and issue prediction over API metric samples
//!
//! This module provides:
//! - The [`Analyzer`] contract shared by every detection dimension
//! - Per-API analyzers for latency, error rate and multi-signal patterns
//! - A global analyzer comparing environments of the same API
//! - The [`AnalysisScheduler`] that drives them periodically

mod cross_environment;
mod error_rate;
pub mod forecast;
pub mod history;
pub mod outlier;
mod pattern;
mod response_time;
mod scheduler;

pub use cross_environment::CrossEnvironmentAnalyzer;
pub use error_rate::ErrorRateAnalyzer;
pub use pattern::PatternAnalyzer;
pub use response_time::ResponseTimeAnalyzer;
pub use scheduler::{AnalysisConfig, AnalysisScheduler, AnalysisSchedulerBuilder, CycleReport};

use crate::error::AnalyzerError;
use crate::models::{Anomaly, ApiSourceConfig, Metric, Prediction};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Group key for per-endpoint analysis: (HTTP method, endpoint path)
pub type EndpointKey = (String, String);

/// A detection dimension over a batch of metric samples.
///
/// Implementors provide `try_detect`/`try_predict`; callers use the provided
/// `detect_anomalies`/`predict_issues`, which enforce the minimum sample
/// count and turn internal errors into empty results.
pub trait Analyzer: Send {
    fn name(&self) -> &'static str;

    fn min_data_points(&self) -> usize;

    fn try_detect(&mut self, metrics: &[Metric]) -> Result<Vec<Anomaly>, AnalyzerError>;

    fn try_predict(&mut self, metrics: &[Metric]) -> Result<Vec<Prediction>, AnalyzerError>;

    /// Apply a changed API configuration
    fn update_config(&mut self, _source: &ApiSourceConfig) {}

    /// Release per-API state. Idempotent.
    fn cleanup(&mut self) {}

    fn detect_anomalies(&mut self, metrics: &[Metric]) -> Vec<Anomaly> {
        if metrics.len() < self.min_data_points() {
            debug!(
                analyzer = self.name(),
                samples = metrics.len(),
                required = self.min_data_points(),
                "Not enough samples for anomaly detection"
            );
            return Vec::new();
        }
        match self.try_detect(metrics) {
            Ok(anomalies) => anomalies,
            Err(e) => {
                warn!(analyzer = self.name(), error = %e, "Anomaly detection failed");
                Vec::new()
            }
        }
    }

    fn predict_issues(&mut self, metrics: &[Metric]) -> Vec<Prediction> {
        if metrics.len() < self.min_data_points() {
            debug!(
                analyzer = self.name(),
                samples = metrics.len(),
                required = self.min_data_points(),
                "Not enough samples for prediction"
            );
            return Vec::new();
        }
        match self.try_predict(metrics) {
            Ok(predictions) => predictions,
            Err(e) => {
                warn!(analyzer = self.name(), error = %e, "Prediction failed");
                Vec::new()
            }
        }
    }
}

/// The per-API analyzer set
pub fn analyzers_for(source: &ApiSourceConfig) -> Vec<Box<dyn Analyzer>> {
    vec![
        Box::new(ResponseTimeAnalyzer::new(source)),
        Box::new(ErrorRateAnalyzer::new(source)),
        Box::new(PatternAnalyzer::new(source)),
    ]
}

/// Analyzers that look across every API at once
pub fn global_analyzers() -> Vec<Box<dyn Analyzer>> {
    vec![Box::new(CrossEnvironmentAnalyzer::new())]
}

/// Split samples by (method, endpoint), each group sorted by timestamp
pub fn group_by_endpoint(metrics: &[Metric]) -> BTreeMap<EndpointKey, Vec<Metric>> {
    let mut groups: BTreeMap<EndpointKey, Vec<Metric>> = BTreeMap::new();
    for m in metrics {
        groups
            .entry((m.method.to_ascii_uppercase(), m.endpoint.clone()))
            .or_default()
            .push(m.clone());
    }
    for group in groups.values_mut() {
        group.sort_by_key(|m| m.timestamp);
    }
    groups
}

/// Fraction of failed samples, `None` when empty
pub fn error_rate<'a>(metrics: impl IntoIterator<Item = &'a Metric>) -> Option<f64> {
    let (errors, total) = metrics
        .into_iter()
        .fold((0usize, 0usize), |(e, t), m| (e + m.is_error() as usize, t + 1));
    (total > 0).then(|| errors as f64 / total as f64)
}

/// Mean latency over samples that carry one
pub fn mean_latency<'a>(metrics: impl IntoIterator<Item = &'a Metric>) -> Option<f64> {
    history::mean(metrics.into_iter().filter_map(|m| m.latency_ms))
}
