//! Comparison of the same API endpoint across deployment environments

use super::history::{HistoryStore, MetricHistory, DEFAULT_HISTORY_CAPACITY};
use super::{error_rate, mean_latency, Analyzer, EndpointKey};
use crate::error::AnalyzerError;
use crate::models::{
    anomaly_types, prediction_types, Anomaly, Environment, Metric, Prediction, Trend,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

pub const MIN_DATA_POINTS: usize = 20;

/// Relative latency difference between two environments worth reporting
pub const LATENCY_DISCREPANCY: f64 = 0.3;
pub const ERROR_RATE_FLOOR: f64 = 0.05;
pub const ERROR_RATE_FACTOR: f64 = 2.0;
pub const LATENCY_CHANGE_FACTOR: f64 = 1.5;

/// Two environments changing within this window count as a propagation
pub const PROPAGATION_WINDOW_SECS: i64 = 1800;
pub const PROPAGATION_SEVERITY: f64 = 0.8;

/// Error rate in the last 30 minutes that marks a source environment
pub const PREDICTION_ERROR_RATE: f64 = 0.1;
pub const PREDICTION_HORIZON_MINUTES: i64 = 30;
pub const MIN_PREDICTION_CONFIDENCE: f64 = 0.6;

type ApiEndpoint = (String, EndpointKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    ErrorRate,
    ResponseTime,
}

impl ChangeKind {
    fn label(&self) -> &'static str {
        match self {
            ChangeKind::ErrorRate => "error rate",
            ChangeKind::ResponseTime => "response time",
        }
    }
}

/// A significant change seen in one environment's recent samples
struct EnvChange {
    environment: Environment,
    first_seen: DateTime<Utc>,
    kinds: Vec<ChangeKind>,
    error_rate: f64,
    latency: f64,
}

/// Global analyzer: receives every API's samples at once.
pub struct CrossEnvironmentAnalyzer {
    min_points: usize,
    history: HistoryStore<(String, EndpointKey, Environment)>,
}

impl Default for CrossEnvironmentAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl CrossEnvironmentAnalyzer {
    pub fn new() -> Self {
        Self {
            min_points: MIN_DATA_POINTS,
            history: HistoryStore::new(DEFAULT_HISTORY_CAPACITY),
        }
    }

    /// Environments with enough samples, per (api, endpoint)
    fn viable_groups(&self, metrics: &[Metric]) -> BTreeMap<ApiEndpoint, BTreeMap<Environment, Vec<Metric>>> {
        let mut groups: BTreeMap<ApiEndpoint, BTreeMap<Environment, Vec<Metric>>> = BTreeMap::new();
        for m in metrics {
            let key = (
                m.api_id.clone(),
                (m.method.to_ascii_uppercase(), m.endpoint.clone()),
            );
            groups
                .entry(key)
                .or_default()
                .entry(m.environment)
                .or_default()
                .push(m.clone());
        }
        for envs in groups.values_mut() {
            envs.retain(|_, samples| samples.len() >= self.min_points);
            for samples in envs.values_mut() {
                samples.sort_by_key(|m| m.timestamp);
            }
        }
        groups.retain(|_, envs| envs.len() >= 2);
        groups
    }

    fn discrepancies(
        &self,
        (api_id, (method, endpoint)): &ApiEndpoint,
        envs: &BTreeMap<Environment, Vec<Metric>>,
    ) -> Vec<Anomaly> {
        let stats: Vec<(Environment, Option<f64>, f64, DateTime<Utc>)> = envs
            .iter()
            .filter_map(|(env, samples)| {
                let last = samples.last()?;
                Some((*env, mean_latency(samples), error_rate(samples)?, last.timestamp))
            })
            .collect();

        let mut anomalies = Vec::new();
        for (i, a) in stats.iter().enumerate() {
            for b in &stats[i + 1..] {
                if let (Some(rt_a), Some(rt_b)) = (a.1, b.1) {
                    let average = (rt_a + rt_b) / 2.0;
                    let diff = if average > 0.0 { (rt_a - rt_b).abs() / average } else { 0.0 };
                    if diff > LATENCY_DISCREPANCY {
                        let (slow, slow_rt, fast, fast_rt) = if rt_a > rt_b {
                            (a, rt_a, b, rt_b)
                        } else {
                            (b, rt_b, a, rt_a)
                        };
                        anomalies.push(
                            Anomaly::new(
                                api_id,
                                anomaly_types::CROSS_ENV_RESPONSE_TIME,
                                diff,
                                slow.3,
                                slow.0,
                                slow_rt,
                            )
                            .with_description(format!(
                                "Response time for {} {} in {} is {:.0}% higher than in {}",
                                method,
                                endpoint,
                                slow.0,
                                (slow_rt / fast_rt - 1.0) * 100.0,
                                fast.0
                            ))
                            .with_expected(fast_rt, fast_rt * (1.0 + LATENCY_DISCREPANCY))
                            .with_context("endpoint", endpoint.clone())
                            .with_context("method", method.clone())
                            .with_context("comparison_environment", fast.0.as_str())
                            .with_context("relative_difference", diff),
                        );
                    }
                }

                for (worse, other) in [(a, b), (b, a)] {
                    if worse.2 > ERROR_RATE_FLOOR && worse.2 > other.2 * ERROR_RATE_FACTOR {
                        anomalies.push(
                            Anomaly::new(
                                api_id,
                                anomaly_types::CROSS_ENV_ERROR_RATE,
                                worse.2,
                                worse.3,
                                worse.0,
                                worse.2,
                            )
                            .with_description(format!(
                                "Error rate for {} {} in {} is {:.1}% compared to {:.1}% in {}",
                                method,
                                endpoint,
                                worse.0,
                                worse.2 * 100.0,
                                other.2 * 100.0,
                                other.0
                            ))
                            .with_expected(
                                other.2,
                                ERROR_RATE_FLOOR.max(other.2 * ERROR_RATE_FACTOR),
                            )
                            .with_context("endpoint", endpoint.clone())
                            .with_context("method", method.clone())
                            .with_context("comparison_environment", other.0.as_str()),
                        );
                    }
                }
            }
        }
        anomalies
    }

    /// Compare the last hour of each environment with its stored history
    fn recent_changes(
        &self,
        (api_id, key): &ApiEndpoint,
        envs: &BTreeMap<Environment, Vec<Metric>>,
    ) -> Vec<EnvChange> {
        let mut changes: Vec<EnvChange> = envs
            .iter()
            .filter_map(|(env, samples)| {
                let history = self.history.get(&(api_id.clone(), key.clone(), *env))?;
                significant_change(*env, samples, history)
            })
            .collect();
        changes.sort_by_key(|c| c.first_seen);
        changes
    }

    fn propagations(
        &self,
        (api_id, (method, endpoint)): &ApiEndpoint,
        changes: &[EnvChange],
    ) -> Vec<Anomaly> {
        changes
            .windows(2)
            .filter_map(|pair| {
                let (source, target) = (&pair[0], &pair[1]);
                let elapsed = (target.first_seen - source.first_seen).num_seconds();
                if elapsed > PROPAGATION_WINDOW_SECS {
                    return None;
                }
                let common: Vec<ChangeKind> = source
                    .kinds
                    .iter()
                    .copied()
                    .filter(|k| target.kinds.contains(k))
                    .collect();
                if common.is_empty() {
                    return None;
                }
                let value = if common.contains(&ChangeKind::ResponseTime) {
                    target.latency
                } else {
                    target.error_rate
                };
                let labels: Vec<&str> = common.iter().map(ChangeKind::label).collect();
                Some(
                    Anomaly::new(
                        api_id,
                        anomaly_types::CROSS_ENV_PROPAGATION,
                        PROPAGATION_SEVERITY,
                        target.first_seen,
                        target.environment,
                        value,
                    )
                    .with_description(format!(
                        "{} issue propagating from {} to {} for {} {}",
                        capitalize(&labels.join(" and ")),
                        source.environment,
                        target.environment,
                        method,
                        endpoint
                    ))
                    .with_context("endpoint", endpoint.clone())
                    .with_context("method", method.clone())
                    .with_context("source_environment", source.environment.as_str())
                    .with_context("propagation_time_seconds", elapsed)
                    .with_context("source_timestamp", source.first_seen.to_rfc3339())
                    .with_context("target_timestamp", target.first_seen.to_rfc3339()),
                )
            })
            .collect()
    }

    fn propagation_forecasts(
        &self,
        (api_id, (method, endpoint)): &ApiEndpoint,
        envs: &BTreeMap<Environment, Vec<Metric>>,
    ) -> Vec<Prediction> {
        let Some(reference) = envs.values().filter_map(|s| s.last()).map(|m| m.timestamp).max()
        else {
            return Vec::new();
        };
        let recent_start = reference - Duration::minutes(PREDICTION_HORIZON_MINUTES);
        let predicted_for = reference + Duration::minutes(PREDICTION_HORIZON_MINUTES);

        let mut predictions = Vec::new();
        for (source_env, samples) in envs {
            let (before, recent): (Vec<&Metric>, Vec<&Metric>) =
                samples.iter().partition(|m| m.timestamp < recent_start);
            if recent.is_empty() {
                continue;
            }
            let mut kinds = Vec::new();
            if error_rate(recent.iter().copied()).is_some_and(|r| r > PREDICTION_ERROR_RATE) {
                kinds.push(ChangeKind::ErrorRate);
            }
            if let (Some(now), Some(baseline)) = (
                mean_latency(recent.iter().copied()),
                mean_latency(before.iter().copied()),
            ) {
                if now > baseline * LATENCY_CHANGE_FACTOR {
                    kinds.push(ChangeKind::ResponseTime);
                }
            }

            for (target_env, target_samples) in envs {
                if target_env.topology_rank() <= source_env.topology_rank() {
                    continue;
                }
                let steps = (target_env.topology_rank() - source_env.topology_rank()) as f64;
                let confidence = (1.0 - 0.1 * steps).max(MIN_PREDICTION_CONFIDENCE);
                for kind in &kinds {
                    let (prediction_type, source_value, target_value) = match kind {
                        ChangeKind::ErrorRate => (
                            prediction_types::CROSS_ENV_ERROR_PROPAGATION,
                            error_rate(samples),
                            error_rate(target_samples),
                        ),
                        ChangeKind::ResponseTime => (
                            prediction_types::CROSS_ENV_RESPONSE_TIME_PROPAGATION,
                            mean_latency(samples),
                            mean_latency(target_samples),
                        ),
                    };
                    let (Some(source_value), Some(target_value)) = (source_value, target_value)
                    else {
                        continue;
                    };
                    predictions.push(
                        Prediction::new(
                            api_id,
                            prediction_type,
                            confidence,
                            predicted_for,
                            source_value,
                            target_value,
                            Trend::Increasing,
                            *target_env,
                        )
                        .with_description(format!(
                            "{} increase likely to propagate from {} to {} for {} {}",
                            capitalize(kind.label()),
                            source_env,
                            target_env,
                            method,
                            endpoint
                        ))
                        .with_context("endpoint", endpoint.clone())
                        .with_context("method", method.clone())
                        .with_context("source_environment", source_env.as_str()),
                    );
                }
            }
        }
        predictions
    }
}

impl Analyzer for CrossEnvironmentAnalyzer {
    fn name(&self) -> &'static str {
        "cross_environment"
    }

    fn min_data_points(&self) -> usize {
        self.min_points
    }

    fn try_detect(&mut self, metrics: &[Metric]) -> Result<Vec<Anomaly>, AnalyzerError> {
        let mut anomalies = Vec::new();
        for (group, envs) in self.viable_groups(metrics) {
            anomalies.extend(self.discrepancies(&group, &envs));
            let changes = self.recent_changes(&group, &envs);
            if changes.len() >= 2 {
                anomalies.extend(self.propagations(&group, &changes));
            }

            let (api_id, key) = group;
            for (env, samples) in &envs {
                self.history
                    .entry((api_id.clone(), key.clone(), *env))
                    .extend(samples);
            }
        }
        Ok(anomalies)
    }

    fn try_predict(&mut self, metrics: &[Metric]) -> Result<Vec<Prediction>, AnalyzerError> {
        Ok(self
            .viable_groups(metrics)
            .iter()
            .flat_map(|(group, envs)| self.propagation_forecasts(group, envs))
            .collect())
    }

    fn cleanup(&mut self) {
        self.history.clear();
    }
}

fn significant_change(
    environment: Environment,
    samples: &[Metric],
    history: &MetricHistory,
) -> Option<EnvChange> {
    let newest = samples.last()?.timestamp;
    let recent: Vec<&Metric> = samples
        .iter()
        .filter(|m| m.timestamp >= newest - Duration::hours(1))
        .collect();
    let first_seen = recent.first()?.timestamp;

    let recent_rate = error_rate(recent.iter().copied())?;
    let recent_latency = mean_latency(recent.iter().copied()).unwrap_or_default();
    let mut kinds = Vec::new();
    if let Some(historical) = history.error_rate() {
        if recent_rate > historical * ERROR_RATE_FACTOR && recent_rate > ERROR_RATE_FLOOR {
            kinds.push(ChangeKind::ErrorRate);
        }
    }
    if let Some(historical) = history.mean_latency() {
        if recent_latency > historical * LATENCY_CHANGE_FACTOR {
            kinds.push(ChangeKind::ResponseTime);
        }
    }
    (!kinds.is_empty()).then_some(EnvChange {
        environment,
        first_seen,
        kinds,
        error_rate: recent_rate,
        latency: recent_latency,
    })
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    fn paired(x: f64, y: f64) -> Vec<Metric> {
        let mut metrics = steady("api", Environment::Aws, 30, x);
        metrics.extend(steady("api", Environment::Gcp, 30, y));
        metrics
    }

    #[test]
    fn test_latency_discrepancy_flags_slower_environment() {
        let mut analyzer = CrossEnvironmentAnalyzer::new();
        let anomalies = analyzer.detect_anomalies(&paired(100.0, 160.0));

        assert_eq!(anomalies.len(), 1);
        let a = &anomalies[0];
        assert_eq!(a.anomaly_type, anomaly_types::CROSS_ENV_RESPONSE_TIME);
        assert_eq!(a.environment, Environment::Gcp);
        assert!((a.expected_value.unwrap() - 100.0).abs() < 1.0);
        assert!((a.threshold.unwrap() - 130.0).abs() < 1.0);
        assert!((0.0..=1.0).contains(&a.severity));
    }

    #[test]
    fn test_similar_environments_are_quiet() {
        let mut analyzer = CrossEnvironmentAnalyzer::new();
        assert!(analyzer.detect_anomalies(&paired(100.0, 110.0)).is_empty());
    }

    #[test]
    fn test_single_environment_is_ignored() {
        let mut analyzer = CrossEnvironmentAnalyzer::new();
        let metrics = steady("api", Environment::Aws, 40, 100.0);
        assert!(analyzer.detect_anomalies(&metrics).is_empty());
        assert!(analyzer.predict_issues(&metrics).is_empty());
    }

    #[test]
    fn test_error_rate_discrepancy() {
        let mut analyzer = CrossEnvironmentAnalyzer::new();
        let mut metrics = steady("api", Environment::Aws, 30, 100.0);
        metrics.extend((0..30).map(|i| sample("api", Environment::Azure, i * 60, 100.0, i % 5 != 0)));

        let anomalies = analyzer.detect_anomalies(&metrics);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, anomaly_types::CROSS_ENV_ERROR_RATE);
        assert_eq!(anomalies[0].environment, Environment::Azure);
        assert!((anomalies[0].severity - 0.2).abs() < 1e-9);
        assert_eq!(anomalies[0].threshold, Some(ERROR_RATE_FLOOR));
    }

    #[test]
    fn test_propagation_after_baseline() {
        let mut analyzer = CrossEnvironmentAnalyzer::new();
        // Establish a quiet baseline for both environments
        let mut baseline = steady("api", Environment::OnPremises, 30, 100.0);
        baseline.extend(steady("api", Environment::Aws, 30, 100.0));
        assert!(analyzer.detect_anomalies(&baseline).is_empty());

        // Latency doubles on premises first, then ten minutes later in AWS
        let later = |env, start: i64| -> Vec<Metric> {
            (0..30)
                .map(|i| sample("api", env, 7200 + start + i * 60, 250.0, true))
                .collect()
        };
        let mut metrics = later(Environment::OnPremises, 0);
        metrics.extend(later(Environment::Aws, 600));

        let propagation: Vec<Anomaly> = analyzer
            .detect_anomalies(&metrics)
            .into_iter()
            .filter(|a| a.anomaly_type == anomaly_types::CROSS_ENV_PROPAGATION)
            .collect();
        assert_eq!(propagation.len(), 1);
        let a = &propagation[0];
        assert_eq!(a.environment, Environment::Aws);
        assert_eq!(a.severity, PROPAGATION_SEVERITY);
        assert_eq!(a.context["source_environment"], "on-premises");
        assert_eq!(a.context["propagation_time_seconds"], 600);
    }

    #[test]
    fn test_predicts_spread_to_later_stage() {
        let mut analyzer = CrossEnvironmentAnalyzer::new();
        // On premises: an hour at 100ms then half an hour at 300ms
        let mut metrics: Vec<Metric> = (0..60)
            .map(|i| {
                let latency = if i < 30 { 100.0 } else { 300.0 };
                sample("api", Environment::OnPremises, i * 60, latency, true)
            })
            .collect();
        metrics.extend(steady("api", Environment::Azure, 60, 100.0));

        let predictions = analyzer.predict_issues(&metrics);
        assert_eq!(predictions.len(), 1);
        let p = &predictions[0];
        assert_eq!(p.prediction_type, prediction_types::CROSS_ENV_RESPONSE_TIME_PROPAGATION);
        assert_eq!(p.environment, Environment::Azure);
        assert!((p.confidence - 0.9).abs() < 1e-9);
        assert_eq!(p.trend, Trend::Increasing);
    }
}
