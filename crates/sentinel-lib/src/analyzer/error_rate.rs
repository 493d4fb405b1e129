//! Error-rate analysis per endpoint

use super::{error_rate, group_by_endpoint, Analyzer};
use crate::error::AnalyzerError;
use crate::models::{
    anomaly_types, prediction_types, Anomaly, ApiSourceConfig, Metric, Prediction, Trend,
};
use chrono::Duration;

pub const MIN_DATA_POINTS: usize = 20;

/// Error rate above which an anomaly is raised
pub const ERROR_RATE_THRESHOLD: f64 = 0.05;

/// Baseline error rate reported as the expected value
pub const EXPECTED_ERROR_RATE: f64 = 0.01;

/// Samples needed in each comparison hour before predicting
pub const MIN_SAMPLES_PER_HOUR: usize = 10;

/// Recent/previous ratio that counts as a rising error rate
pub const RISE_FACTOR: f64 = 1.5;

/// Recent error rate floor for predictions
pub const MIN_RECENT_RATE: f64 = 0.02;

pub struct ErrorRateAnalyzer {
    api_id: String,
    min_points: usize,
}

impl ErrorRateAnalyzer {
    pub fn new(source: &ApiSourceConfig) -> Self {
        Self {
            api_id: source.id.clone(),
            min_points: source.min_data_points.unwrap_or(MIN_DATA_POINTS),
        }
    }
}

impl Analyzer for ErrorRateAnalyzer {
    fn name(&self) -> &'static str {
        "error_rate"
    }

    fn min_data_points(&self) -> usize {
        self.min_points
    }

    fn try_detect(&mut self, metrics: &[Metric]) -> Result<Vec<Anomaly>, AnalyzerError> {
        let mut anomalies = Vec::new();
        for ((method, endpoint), group) in group_by_endpoint(metrics) {
            if group.len() < self.min_points {
                continue;
            }
            let (Some(rate), Some(last)) = (error_rate(&group), group.last()) else {
                continue;
            };
            if rate <= ERROR_RATE_THRESHOLD {
                continue;
            }
            let errors = group.iter().filter(|m| m.is_error()).count();
            anomalies.push(
                Anomaly::new(
                    &self.api_id,
                    anomaly_types::HIGH_ERROR_RATE,
                    rate * 5.0,
                    last.timestamp,
                    last.environment,
                    rate,
                )
                .with_description(format!(
                    "High error rate of {:.1}% detected for {} {}",
                    rate * 100.0,
                    method,
                    endpoint
                ))
                .with_expected(EXPECTED_ERROR_RATE, ERROR_RATE_THRESHOLD)
                .with_context("endpoint", endpoint.clone())
                .with_context("method", method.clone())
                .with_context("error_count", errors)
                .with_context("total_count", group.len())
                .with_context(
                    "time_range",
                    format!(
                        "{} to {}",
                        group[0].timestamp.to_rfc3339(),
                        last.timestamp.to_rfc3339()
                    ),
                ),
            );
        }
        Ok(anomalies)
    }

    /// Compare the last hour with the hour before it, both measured back
    /// from the newest sample in each group.
    fn try_predict(&mut self, metrics: &[Metric]) -> Result<Vec<Prediction>, AnalyzerError> {
        let mut predictions = Vec::new();
        for ((method, endpoint), group) in group_by_endpoint(metrics) {
            if group.len() < self.min_points {
                continue;
            }
            let Some(last) = group.last() else {
                continue;
            };
            let reference = last.timestamp;
            let one_hour_ago = reference - Duration::hours(1);
            let two_hours_ago = reference - Duration::hours(2);

            let recent: Vec<&Metric> = group.iter().filter(|m| m.timestamp > one_hour_ago).collect();
            let previous: Vec<&Metric> = group
                .iter()
                .filter(|m| m.timestamp > two_hours_ago && m.timestamp <= one_hour_ago)
                .collect();
            if recent.len() < MIN_SAMPLES_PER_HOUR || previous.len() < MIN_SAMPLES_PER_HOUR {
                continue;
            }
            let (Some(recent_rate), Some(previous_rate)) =
                (error_rate(recent.iter().copied()), error_rate(previous.iter().copied()))
            else {
                continue;
            };
            if recent_rate < previous_rate * RISE_FACTOR || recent_rate <= MIN_RECENT_RATE {
                continue;
            }

            let predicted = (recent_rate + (recent_rate - previous_rate)).min(1.0);
            let confidence = (0.5 + recent_rate / 0.1).min(0.9);
            predictions.push(
                Prediction::new(
                    &self.api_id,
                    prediction_types::ERROR_RATE,
                    confidence,
                    reference + Duration::hours(1),
                    predicted,
                    recent_rate,
                    Trend::Increasing,
                    last.environment,
                )
                .with_description(format!(
                    "Error rate for {} {} projected to reach {:.1}% within the next hour",
                    method,
                    endpoint,
                    predicted * 100.0
                ))
                .with_context("endpoint", endpoint.clone())
                .with_context("method", method.clone())
                .with_context("previous_error_rate", previous_rate)
                .with_context("recent_error_rate", recent_rate),
            );
        }
        Ok(predictions)
    }

    fn update_config(&mut self, source: &ApiSourceConfig) {
        self.min_points = source.min_data_points.unwrap_or(MIN_DATA_POINTS);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::models::Environment;

    #[test]
    fn test_six_percent_errors_raise_one_anomaly() {
        let mut analyzer = ErrorRateAnalyzer::new(&source("api"));
        let metrics: Vec<Metric> = (0..100)
            .map(|i| sample("api", Environment::Gcp, i * 30, 120.0, i % 17 != 3 || i > 90))
            .collect();
        assert_eq!(metrics.iter().filter(|m| !m.success).count(), 6);

        let anomalies = analyzer.detect_anomalies(&metrics);
        assert_eq!(anomalies.len(), 1);
        let a = &anomalies[0];
        assert_eq!(a.anomaly_type, anomaly_types::HIGH_ERROR_RATE);
        assert!((a.severity - 0.3).abs() < 1e-9);
        assert_eq!(a.expected_value, Some(EXPECTED_ERROR_RATE));
        assert_eq!(a.threshold, Some(ERROR_RATE_THRESHOLD));
        assert_eq!(a.environment, Environment::Gcp);
    }

    #[test]
    fn test_low_error_rate_is_quiet() {
        let mut analyzer = ErrorRateAnalyzer::new(&source("api"));
        let metrics: Vec<Metric> = (0..100)
            .map(|i| sample("api", Environment::Aws, i * 30, 120.0, i % 25 != 0))
            .collect();
        assert!(analyzer.detect_anomalies(&metrics).is_empty());
    }

    #[test]
    fn test_rising_error_rate_is_predicted() {
        let mut analyzer = ErrorRateAnalyzer::new(&source("api"));
        // Two hours at one sample per minute: 2% errors, then 10%
        let metrics: Vec<Metric> = (0..120)
            .map(|i| {
                let ok = if i < 60 { i % 50 != 0 } else { i % 10 != 0 };
                sample("api", Environment::Aws, i * 60 + 30, 80.0, ok)
            })
            .collect();

        let predictions = analyzer.predict_issues(&metrics);
        assert_eq!(predictions.len(), 1);
        let p = &predictions[0];
        assert_eq!(p.trend, Trend::Increasing);
        assert!((p.current_value - 0.1).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&p.predicted_value));
        assert!(p.predicted_value > p.current_value);
        assert_eq!(p.confidence, 0.9);
        assert_eq!(p.predicted_for, metrics[119].timestamp + Duration::hours(1));
    }

    #[test]
    fn test_prediction_needs_both_hours() {
        let mut analyzer = ErrorRateAnalyzer::new(&source("api"));
        let metrics: Vec<Metric> = (0..40)
            .map(|i| sample("api", Environment::Aws, i * 60, 80.0, i % 5 != 0))
            .collect();
        assert!(analyzer.predict_issues(&metrics).is_empty());
    }
}
