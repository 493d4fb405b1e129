//! Multi-signal pattern analysis: error bursts and joint latency/status outliers

use super::history::{mean, std_dev};
use super::outlier::{IsolationForest, DEFAULT_SUBSAMPLE, DEFAULT_TREES, FOREST_SEED};
use super::{error_rate, group_by_endpoint, Analyzer, EndpointKey};
use crate::error::AnalyzerError;
use crate::models::{anomaly_types, Anomaly, ApiSourceConfig, Metric, Prediction};
use chrono::{Duration, DurationRound};
use std::collections::BTreeMap;
use tracing::debug;

pub const MIN_DATA_POINTS: usize = 20;

pub const BURST_BUCKET_MINUTES: i64 = 5;
pub const BURST_MIN_SAMPLES: usize = 5;
pub const BURST_ERROR_RATE: f64 = 0.10;
pub const BURST_SEVERITY: f64 = 0.9;
pub const BURST_EXPECTED_RATE: f64 = 0.05;

/// Forest score a point must exceed regardless of the contamination cut
pub const STRONG_OUTLIER_SCORE: f64 = 0.75;
pub const OUTLIER_SEVERITY: f64 = 0.8;
pub const OUTLIER_CONTAMINATION: f64 = 0.05;

pub struct PatternAnalyzer {
    api_id: String,
    min_points: usize,
}

impl PatternAnalyzer {
    pub fn new(source: &ApiSourceConfig) -> Self {
        Self {
            api_id: source.id.clone(),
            min_points: source.min_data_points.unwrap_or(MIN_DATA_POINTS),
        }
    }

    fn error_bursts(&self, key: &EndpointKey, group: &[Metric]) -> Vec<Anomaly> {
        let step = Duration::minutes(BURST_BUCKET_MINUTES);
        let mut buckets: BTreeMap<_, Vec<&Metric>> = BTreeMap::new();
        for m in group {
            if let Ok(start) = m.timestamp.duration_trunc(step) {
                buckets.entry(start).or_default().push(m);
            }
        }

        buckets
            .into_iter()
            .filter(|(_, bucket)| bucket.len() >= BURST_MIN_SAMPLES)
            .filter_map(|(start, bucket)| {
                let rate = error_rate(bucket.iter().copied())?;
                if rate <= BURST_ERROR_RATE {
                    return None;
                }
                let last = bucket.last()?;
                let errors = bucket.iter().filter(|m| m.is_error()).count();
                Some(
                    Anomaly::new(
                        &self.api_id,
                        anomaly_types::ERROR_RATE_PATTERN,
                        BURST_SEVERITY,
                        last.timestamp,
                        last.environment,
                        rate,
                    )
                    .with_description(format!(
                        "Error burst of {:.1}% in the {} minutes from {} for {} {}",
                        rate * 100.0,
                        BURST_BUCKET_MINUTES,
                        start.format("%H:%M"),
                        key.0,
                        key.1
                    ))
                    .with_expected(BURST_EXPECTED_RATE, BURST_ERROR_RATE)
                    .with_context("endpoint", key.1.clone())
                    .with_context("method", key.0.clone())
                    .with_context("bucket_start", start.to_rfc3339())
                    .with_context("error_count", errors)
                    .with_context("total_count", bucket.len()),
                )
            })
            .collect()
    }

    fn joint_outliers(
        &self,
        key: &EndpointKey,
        group: &[Metric],
    ) -> Result<Vec<Anomaly>, AnalyzerError> {
        let rows: Vec<(&Metric, Vec<f64>)> = group
            .iter()
            .filter_map(|m| {
                m.latency_ms
                    .map(|l| (m, vec![l, m.is_error() as u8 as f64, m.status_class()]))
            })
            .collect();
        if rows.len() < self.min_points {
            return Ok(Vec::new());
        }

        let data: Vec<Vec<f64>> = rows.iter().map(|(_, f)| f.clone()).collect();
        let forest = IsolationForest::fit(
            &data,
            DEFAULT_TREES,
            DEFAULT_SUBSAMPLE,
            OUTLIER_CONTAMINATION,
            FOREST_SEED,
        )?;
        let cut = forest.threshold().max(STRONG_OUTLIER_SCORE);

        let latencies: Vec<f64> = data.iter().map(|f| f[0]).collect();
        let window_mean = mean(latencies.iter().copied()).unwrap_or_default();
        let spread = std_dev(&latencies).unwrap_or_default();

        Ok(rows
            .iter()
            .filter_map(|(metric, features)| {
                let score = forest.score(features);
                (score > cut).then(|| {
                    Anomaly::new(
                        &self.api_id,
                        anomaly_types::RESPONSE_TIME_PATTERN,
                        OUTLIER_SEVERITY,
                        metric.timestamp,
                        metric.environment,
                        features[0],
                    )
                    .with_description(format!(
                        "Unusual combination of latency {:.1}ms and status {} for {} {}",
                        features[0],
                        metric
                            .status_code
                            .map_or_else(|| "unknown".to_string(), |s| s.to_string()),
                        key.0,
                        key.1
                    ))
                    .with_expected(window_mean, 2.0 * spread)
                    .with_context("endpoint", key.1.clone())
                    .with_context("method", key.0.clone())
                    .with_context("anomaly_score", score)
                })
            })
            .collect())
    }
}

impl Analyzer for PatternAnalyzer {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn min_data_points(&self) -> usize {
        self.min_points
    }

    fn try_detect(&mut self, metrics: &[Metric]) -> Result<Vec<Anomaly>, AnalyzerError> {
        let mut anomalies = Vec::new();
        for (key, group) in group_by_endpoint(metrics) {
            if group.len() < self.min_points {
                continue;
            }
            anomalies.extend(self.error_bursts(&key, &group));
            match self.joint_outliers(&key, &group) {
                Ok(outliers) => anomalies.extend(outliers),
                Err(e) => debug!(
                    api_id = %self.api_id,
                    method = %key.0,
                    endpoint = %key.1,
                    error = %e,
                    "Skipping outlier scan for endpoint"
                ),
            }
        }
        Ok(anomalies)
    }

    fn try_predict(&mut self, _metrics: &[Metric]) -> Result<Vec<Prediction>, AnalyzerError> {
        Ok(Vec::new())
    }

    fn update_config(&mut self, source: &ApiSourceConfig) {
        self.min_points = source.min_data_points.unwrap_or(MIN_DATA_POINTS);
    }
}
