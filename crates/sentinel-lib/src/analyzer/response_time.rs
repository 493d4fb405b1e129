//! Latency analysis: spikes, sustained pattern changes and forecasts

use super::forecast::{self, AR_ORDER};
use super::history::{mean, HistoryStore, DEFAULT_HISTORY_CAPACITY};
use super::outlier::{knn_scores, IsolationForest, DEFAULT_K, DEFAULT_SUBSAMPLE, DEFAULT_TREES, FOREST_SEED};
use super::{group_by_endpoint, Analyzer, EndpointKey};
use crate::error::AnalyzerError;
use crate::models::{
    anomaly_types, prediction_types, Anomaly, ApiSourceConfig, Metric, Prediction,
    Trend,
};
use chrono::{Datelike, Duration, Timelike};
use tracing::debug;

pub const MIN_DATA_POINTS: usize = 30;

/// kNN score above which a sample is a spike candidate
pub const SPIKE_SCORE_THRESHOLD: f64 = 0.95;

/// Neighbours on each side used for a spike's expected latency
pub const LOCAL_WINDOW: usize = 10;

pub const SPIKE_THRESHOLD_FACTOR: f64 = 1.5;
pub const PATTERN_THRESHOLD_FACTOR: f64 = 1.3;

/// Outliers in a row before a pattern change is reported
pub const MIN_CONSECUTIVE_OUTLIERS: usize = 3;

pub const PATTERN_CONTAMINATION: f64 = 0.1;

pub const FORECAST_MINUTES: usize = 30;
pub const FORECAST_CONFIDENCE: f64 = 0.8;
pub const TREND_DEAD_ZONE: f64 = 0.2;

pub struct ResponseTimeAnalyzer {
    api_id: String,
    min_points: usize,
    history: HistoryStore<EndpointKey>,
}

impl ResponseTimeAnalyzer {
    pub fn new(source: &ApiSourceConfig) -> Self {
        Self {
            api_id: source.id.clone(),
            min_points: source.min_data_points.unwrap_or(MIN_DATA_POINTS),
            history: HistoryStore::new(DEFAULT_HISTORY_CAPACITY),
        }
    }

    fn detect_spikes(&self, key: &EndpointKey, group: &[Metric]) -> Vec<Anomaly> {
        let samples: Vec<(&Metric, f64)> = group
            .iter()
            .filter_map(|m| m.latency_ms.map(|l| (m, l)))
            .collect();
        let values: Vec<f64> = samples.iter().map(|(_, l)| *l).collect();
        let scores = knn_scores(&values, DEFAULT_K);
        let candidate: Vec<bool> = scores.iter().map(|s| *s > SPIKE_SCORE_THRESHOLD).collect();

        let mut anomalies = Vec::new();
        for (i, (metric, observed)) in samples.iter().enumerate() {
            if !candidate[i] {
                continue;
            }
            let Some(expected) = local_expected(&values, &candidate, i) else {
                continue;
            };
            if *observed <= expected {
                continue;
            }
            let severity = if expected > 0.0 {
                (observed - expected) / expected
            } else {
                1.0
            };
            anomalies.push(
                Anomaly::new(
                    &self.api_id,
                    anomaly_types::RESPONSE_TIME_SPIKE,
                    severity,
                    metric.timestamp,
                    metric.environment,
                    *observed,
                )
                .with_description(format!(
                    "Response time spike of {:.1}ms detected for {} {}",
                    observed, key.0, key.1
                ))
                .with_expected(expected, expected * SPIKE_THRESHOLD_FACTOR)
                .with_context("endpoint", key.1.clone())
                .with_context("method", key.0.clone())
                .with_context("anomaly_score", scores[i]),
            );
        }
        anomalies
    }

    fn detect_pattern_changes(
        &self,
        key: &EndpointKey,
        group: &[Metric],
    ) -> Result<Vec<Anomaly>, AnalyzerError> {
        let Some(history) = self.history.get(key) else {
            return Ok(Vec::new());
        };
        if history.len() < self.min_points {
            return Ok(Vec::new());
        }

        let training: Vec<Vec<f64>> = history.iter().filter_map(time_features).collect();
        let current: Vec<(&Metric, Vec<f64>)> = group
            .iter()
            .filter_map(|m| time_features(m).map(|f| (m, f)))
            .collect();
        if training.len() < self.min_points || current.is_empty() {
            return Ok(Vec::new());
        }

        let forest = IsolationForest::fit(
            &training,
            DEFAULT_TREES,
            DEFAULT_SUBSAMPLE,
            PATTERN_CONTAMINATION,
            FOREST_SEED,
        )?
        .with_range_check(&[0]);
        let expected = history.mean_latency().unwrap_or_default();
        let recent_mean =
            mean(current.iter().rev().take(10).map(|(_, f)| f[0])).unwrap_or_default();

        let mut anomalies = Vec::new();
        let mut run = 0usize;
        for (metric, features) in &current {
            let score = forest.score(features);
            if !forest.is_outlier(score) {
                run = 0;
                continue;
            }
            run += 1;
            if run < MIN_CONSECUTIVE_OUTLIERS {
                continue;
            }
            anomalies.push(
                Anomaly::new(
                    &self.api_id,
                    anomaly_types::RESPONSE_TIME_PATTERN_CHANGE,
                    // 0.5 is the neutral isolation score
                    (score - 0.5) * 2.0,
                    metric.timestamp,
                    metric.environment,
                    features[0],
                )
                .with_description(format!(
                    "Response time pattern change detected for {} {}",
                    key.0, key.1
                ))
                .with_expected(expected, expected * PATTERN_THRESHOLD_FACTOR)
                .with_context("endpoint", key.1.clone())
                .with_context("method", key.0.clone())
                .with_context("anomaly_score", score)
                .with_context("historical_mean", expected)
                .with_context("recent_mean", recent_mean),
            );
        }
        Ok(anomalies)
    }

    fn forecast_group(&self, key: &EndpointKey, group: &[Metric]) -> Option<Prediction> {
        let (start, series) = forecast::resample(group, Duration::minutes(1))?;
        let path = forecast::forecast(&series, FORECAST_MINUTES, AR_ORDER)?;
        let predicted = path.last().copied()?.max(0.0);
        let current = mean(group.iter().rev().filter_map(|m| m.latency_ms).take(10))?;
        let last_bucket = start + Duration::minutes(series.len() as i64 - 1);
        let environment = group.last()?.environment;

        let trend = Trend::classify(predicted, current, TREND_DEAD_ZONE);
        let description = match trend {
            Trend::Increasing => format!(
                "Response time projected to increase by {:.1}% in 30 minutes",
                (predicted / current - 1.0) * 100.0
            ),
            Trend::Decreasing => format!(
                "Response time projected to decrease by {:.1}% in 30 minutes",
                (1.0 - predicted / current) * 100.0
            ),
            Trend::Stable => "Response time projected to remain stable in the next 30 minutes".to_string(),
        };

        Some(
            Prediction::new(
                &self.api_id,
                prediction_types::RESPONSE_TIME,
                FORECAST_CONFIDENCE,
                last_bucket + Duration::minutes(FORECAST_MINUTES as i64),
                predicted,
                current,
                trend,
                environment,
            )
            .with_description(description)
            .with_context("endpoint", key.1.clone())
            .with_context("method", key.0.clone())
            .with_context(
                "analysis_time_range",
                format!(
                    "{} to {}",
                    group.first()?.timestamp.to_rfc3339(),
                    group.last()?.timestamp.to_rfc3339()
                ),
            ),
        )
    }
}

impl Analyzer for ResponseTimeAnalyzer {
    fn name(&self) -> &'static str {
        "response_time"
    }

    fn min_data_points(&self) -> usize {
        self.min_points
    }

    fn try_detect(&mut self, metrics: &[Metric]) -> Result<Vec<Anomaly>, AnalyzerError> {
        let mut anomalies = Vec::new();
        for (key, group) in group_by_endpoint(metrics) {
            if group.len() >= self.min_points {
                anomalies.extend(self.detect_spikes(&key, &group));
                anomalies.extend(self.detect_pattern_changes(&key, &group)?);
            }
            self.history.entry(key).extend(&group);
        }
        debug!(api_id = %self.api_id, count = anomalies.len(), "Response time detection complete");
        Ok(anomalies)
    }

    fn try_predict(&mut self, metrics: &[Metric]) -> Result<Vec<Prediction>, AnalyzerError> {
        Ok(group_by_endpoint(metrics)
            .iter()
            .filter(|(_, group)| group.len() >= self.min_points)
            .filter_map(|(key, group)| self.forecast_group(key, group))
            .collect())
    }

    fn update_config(&mut self, source: &ApiSourceConfig) {
        self.min_points = source.min_data_points.unwrap_or(MIN_DATA_POINTS);
    }

    fn cleanup(&mut self) {
        self.history.clear();
    }
}

/// Mean of up to `LOCAL_WINDOW` neighbours on each side of `i`, skipping
/// `i` and other spike candidates. Falls back to skipping only `i`.
fn local_expected(values: &[f64], candidate: &[bool], i: usize) -> Option<f64> {
    let lo = i.saturating_sub(LOCAL_WINDOW);
    let hi = (i + LOCAL_WINDOW).min(values.len() - 1);
    let neighbours = (lo..=hi).filter(|&j| j != i);
    mean(neighbours.clone().filter(|&j| !candidate[j]).map(|j| values[j]))
        .or_else(|| mean(neighbours.map(|j| values[j])))
}

/// [latency, hour of day, day of week, error flag, status class]
fn time_features(m: &Metric) -> Option<Vec<f64>> {
    let latency = m.latency_ms?;
    Some(vec![
        latency,
        m.timestamp.hour() as f64,
        m.timestamp.weekday().num_days_from_monday() as f64,
        if m.is_error() { 1.0 } else { 0.0 },
        m.status_class(),
    ])
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::models::Environment;

    fn spike_series() -> Vec<Metric> {
        let mut metrics = steady("api", Environment::Aws, 33, 100.0);
        for (idx, latency) in [(5, 900.0), (16, 950.0), (27, 1000.0)] {
            metrics[idx].latency_ms = Some(latency);
        }
        metrics
    }

    #[test]
    fn test_detects_injected_spikes() {
        let mut analyzer = ResponseTimeAnalyzer::new(&source("api"));
        let anomalies = analyzer.detect_anomalies(&spike_series());

        let spikes: Vec<_> = anomalies
            .iter()
            .filter(|a| a.anomaly_type == anomaly_types::RESPONSE_TIME_SPIKE)
            .collect();
        assert_eq!(spikes.len(), 3);
        for spike in &spikes {
            assert!(spike.metric_value >= 900.0);
            let expected = spike.expected_value.unwrap();
            assert!((expected - 100.0).abs() <= 20.0, "expected {expected}");
            assert!((spike.threshold.unwrap() - expected * 1.5).abs() < 1e-9);
            assert!((0.0..=1.0).contains(&spike.severity));
            assert_eq!(spike.endpoint(), Some("/orders"));
        }
    }

    #[test]
    fn test_steady_series_has_no_spikes() {
        let mut analyzer = ResponseTimeAnalyzer::new(&source("api"));
        let anomalies = analyzer.detect_anomalies(&steady("api", Environment::Aws, 60, 100.0));
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_below_minimum_returns_empty() {
        let mut analyzer = ResponseTimeAnalyzer::new(&source("api"));
        let metrics = steady("api", Environment::Aws, 29, 100.0);
        assert!(analyzer.detect_anomalies(&metrics).is_empty());
        assert!(analyzer.predict_issues(&metrics).is_empty());
    }

    #[test]
    fn test_min_points_follow_config_updates() {
        let mut src = source("api");
        let mut analyzer = ResponseTimeAnalyzer::new(&src);
        assert_eq!(analyzer.min_data_points(), MIN_DATA_POINTS);

        src.min_data_points = Some(50);
        analyzer.update_config(&src);
        assert_eq!(analyzer.min_data_points(), 50);
    }

    #[test]
    fn test_pattern_change_after_level_shift() {
        let mut analyzer = ResponseTimeAnalyzer::new(&source("api"));
        // Build history at ~100ms, then feed a window sitting at ~400ms
        let baseline = steady("api", Environment::Aws, 120, 100.0);
        analyzer.detect_anomalies(&baseline);

        let shifted: Vec<Metric> = (120..160)
            .map(|i| sample("api", Environment::Aws, i * 60, 400.0 + (i % 3) as f64, true))
            .collect();
        let anomalies = analyzer.detect_anomalies(&shifted);
        let changes: Vec<_> = anomalies
            .iter()
            .filter(|a| a.anomaly_type == anomaly_types::RESPONSE_TIME_PATTERN_CHANGE)
            .collect();

        assert!(!changes.is_empty());
        for change in changes {
            let expected = change.expected_value.unwrap();
            assert!((expected - 100.0).abs() < 5.0);
            assert!((change.threshold.unwrap() - expected * 1.3).abs() < 1e-9);
            assert!((0.0..=1.0).contains(&change.severity));
        }
    }

    #[test]
    fn test_forecast_of_flat_series_is_stable() {
        let mut analyzer = ResponseTimeAnalyzer::new(&source("api"));
        let metrics: Vec<Metric> = (0..40)
            .map(|i| sample("api", Environment::Aws, i * 60, 100.0, true))
            .collect();
        let predictions = analyzer.predict_issues(&metrics);

        assert_eq!(predictions.len(), 1);
        let p = &predictions[0];
        assert_eq!(p.prediction_type, prediction_types::RESPONSE_TIME);
        assert_eq!(p.trend, Trend::Stable);
        assert_eq!(p.confidence, FORECAST_CONFIDENCE);
        assert!((p.predicted_value - 100.0).abs() < 1e-6);
        assert_eq!(
            p.predicted_for,
            metrics.last().unwrap().timestamp + Duration::minutes(30)
        );
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let mut analyzer = ResponseTimeAnalyzer::new(&source("api"));
        analyzer.detect_anomalies(&steady("api", Environment::Aws, 40, 100.0));
        analyzer.cleanup();
        analyzer.cleanup();
        assert!(analyzer.history.is_empty());
    }
}
