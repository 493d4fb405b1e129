//! Core data models for the API sentinel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Free-form key/value context attached to anomalies, predictions and alerts
pub type Context = Map<String, Value>;

/// Deployment environment of a monitored API
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    OnPremises,
    Aws,
    Azure,
    Gcp,
    Other,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::OnPremises => "on-premises",
            Environment::Aws => "aws",
            Environment::Azure => "azure",
            Environment::Gcp => "gcp",
            Environment::Other => "other",
        }
    }

    /// Position in the deployment topology: on-premises first, single
    /// clouds next, anything else last.
    pub fn topology_rank(&self) -> u8 {
        match self {
            Environment::OnPremises => 1,
            Environment::Aws | Environment::Azure | Environment::Gcp => 2,
            Environment::Other => 3,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = std::convert::Infallible;

    /// Unknown tags fall back to `Other` instead of failing.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "on-premises" | "on_premises" | "onprem" => Environment::OnPremises,
            "aws" => Environment::Aws,
            "azure" => Environment::Azure,
            "gcp" => Environment::Gcp,
            _ => Environment::Other,
        })
    }
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(tag.parse().unwrap_or(Environment::Other))
    }
}

/// A single latency/availability sample for one API endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub api_id: String,
    pub endpoint: String,
    pub method: String,
    pub environment: Environment,
    pub timestamp: DateTime<Utc>,
    /// Absent when the request failed before a response arrived
    pub latency_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Metric {
    pub fn is_error(&self) -> bool {
        !self.success
    }

    /// Status code class (2 for 2xx, 5 for 5xx, 0 when unknown)
    pub fn status_class(&self) -> f64 {
        self.status_code.map(|c| (c / 100) as f64).unwrap_or(0.0)
    }
}

/// Anomaly type tags
pub mod anomaly_types {
    pub const RESPONSE_TIME_SPIKE: &str = "response_time_spike";
    pub const RESPONSE_TIME_PATTERN_CHANGE: &str = "response_time_pattern_change";
    pub const HIGH_ERROR_RATE: &str = "high_error_rate";
    pub const RESPONSE_TIME_PATTERN: &str = "response_time_pattern";
    pub const ERROR_RATE_PATTERN: &str = "error_rate_pattern";
    pub const CROSS_ENV_RESPONSE_TIME: &str = "cross_environment_response_time";
    pub const CROSS_ENV_ERROR_RATE: &str = "cross_environment_error_rate";
    pub const CROSS_ENV_PROPAGATION: &str = "cross_environment_propagation";
}

/// Prediction type tags
pub mod prediction_types {
    pub const RESPONSE_TIME: &str = "response_time";
    pub const ERROR_RATE: &str = "error_rate";
    pub const CROSS_ENV_ERROR_PROPAGATION: &str = "cross_environment_error_propagation";
    pub const CROSS_ENV_RESPONSE_TIME_PROPAGATION: &str =
        "cross_environment_response_time_propagation";
}

/// A detected abnormal behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub api_id: String,
    pub anomaly_type: String,
    /// Always within [0, 1]
    pub severity: f64,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub metric_value: f64,
    pub expected_value: Option<f64>,
    pub threshold: Option<f64>,
    pub environment: Environment,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub related_anomalies: Vec<String>,
    #[serde(default)]
    pub processed: bool,
}

impl Anomaly {
    /// Create an unprocessed anomaly with a fresh id and clamped severity
    pub fn new(
        api_id: impl Into<String>,
        anomaly_type: impl Into<String>,
        severity: f64,
        timestamp: DateTime<Utc>,
        environment: Environment,
        metric_value: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            api_id: api_id.into(),
            anomaly_type: anomaly_type.into(),
            severity: clamp_unit(severity),
            timestamp,
            description: String::new(),
            metric_value,
            expected_value: None,
            threshold: None,
            environment,
            context: Context::new(),
            related_anomalies: Vec::new(),
            processed: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_expected(mut self, expected: f64, threshold: f64) -> Self {
        self.expected_value = Some(expected);
        self.threshold = Some(threshold);
        self
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// Endpoint recorded in the context, if any
    pub fn endpoint(&self) -> Option<&str> {
        self.context.get("endpoint").and_then(Value::as_str)
    }

    pub fn method(&self) -> Option<&str> {
        self.context.get("method").and_then(Value::as_str)
    }
}

/// Direction of a forecast relative to the current level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl Trend {
    /// Classify `predicted` against `current` with a relative dead zone
    pub fn classify(predicted: f64, current: f64, dead_zone: f64) -> Self {
        if predicted > current * (1.0 + dead_zone) {
            Trend::Increasing
        } else if predicted < current * (1.0 - dead_zone) {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

/// A forward-looking forecast of an issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub api_id: String,
    pub prediction_type: String,
    /// Always within [0, 1]
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub predicted_for: DateTime<Utc>,
    pub description: String,
    pub predicted_value: f64,
    pub current_value: f64,
    pub trend: Trend,
    pub environment: Environment,
    #[serde(default)]
    pub context: Context,
}

impl Prediction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api_id: impl Into<String>,
        prediction_type: impl Into<String>,
        confidence: f64,
        predicted_for: DateTime<Utc>,
        predicted_value: f64,
        current_value: f64,
        trend: Trend,
        environment: Environment,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            api_id: api_id.into(),
            prediction_type: prediction_type.into(),
            confidence: clamp_unit(confidence),
            created_at: Utc::now(),
            predicted_for,
            description: String::new(),
            predicted_value,
            current_value,
            trend,
            environment,
            context: Context::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

/// Alert severity bucket, derived from the maximum anomaly severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            AlertSeverity::Critical
        } else if score >= 0.7 {
            AlertSeverity::High
        } else if score >= 0.4 {
            AlertSeverity::Medium
        } else {
            AlertSeverity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Critical => "critical",
            AlertSeverity::High => "high",
            AlertSeverity::Medium => "medium",
            AlertSeverity::Low => "low",
        }
    }

    /// High and critical alerts are pushed to notification channels
    pub fn is_notifiable(&self) -> bool {
        matches!(self, AlertSeverity::High | AlertSeverity::Critical)
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
    Snoozed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Snoozed => "snoozed",
        }
    }

    /// Allowed lifecycle edges. `Resolved` is terminal.
    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        use AlertStatus::*;
        matches!(
            (self, next),
            (Open, Acknowledged)
                | (Open, Resolved)
                | (Open, Snoozed)
                | (Acknowledged, Resolved)
                | (Snoozed, Open)
                | (Snoozed, Acknowledged)
                | (Snoozed, Resolved)
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AlertStatus::Open | AlertStatus::Acknowledged)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A grouped, severity-ranked notification unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub title: String,
    pub description: String,
    pub severity: AlertSeverity,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: AlertStatus,
    /// Source anomaly ids, never empty
    pub anomalies: Vec<String>,
    pub apis: Vec<String>,
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

/// Configuration of a monitored API as seen by the analysis scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSourceConfig {
    pub id: String,
    pub name: String,
    pub environment: Environment,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
    /// Per-API override of the analyzers' minimum sample count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_data_points: Option<usize>,
}

fn default_active() -> bool {
    true
}

/// Clamp a score into [0, 1], mapping NaN to 0
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Title-case a snake_case tag ("high_error_rate" -> "High Error Rate")
pub fn title_case(tag: &str) -> String {
    tag.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_environment_falls_back_to_other() {
        let env: Environment = serde_json::from_str("\"mainframe\"").unwrap();
        assert_eq!(env, Environment::Other);
        assert_eq!("on-premises".parse::<Environment>().unwrap(), Environment::OnPremises);
        assert_eq!("Kubernetes".parse::<Environment>().unwrap(), Environment::Other);
        assert_eq!(serde_json::to_string(&Environment::OnPremises).unwrap(), "\"on-premises\"");
    }

    #[test]
    fn test_severity_buckets() {
        assert_eq!(AlertSeverity::from_score(0.95), AlertSeverity::Critical);
        assert_eq!(AlertSeverity::from_score(0.75), AlertSeverity::High);
        assert_eq!(AlertSeverity::from_score(0.5), AlertSeverity::Medium);
        assert_eq!(AlertSeverity::from_score(0.1), AlertSeverity::Low);
    }

    #[test]
    fn test_severity_boundaries_round_up() {
        assert_eq!(AlertSeverity::from_score(0.9), AlertSeverity::Critical);
        assert_eq!(AlertSeverity::from_score(0.7), AlertSeverity::High);
        assert_eq!(AlertSeverity::from_score(0.4), AlertSeverity::Medium);
    }

    #[test]
    fn test_status_transitions() {
        use AlertStatus::*;
        assert!(Open.can_transition_to(Acknowledged));
        assert!(Open.can_transition_to(Resolved));
        assert!(Open.can_transition_to(Snoozed));
        assert!(Acknowledged.can_transition_to(Resolved));
        assert!(!Acknowledged.can_transition_to(Snoozed));
        assert!(!Acknowledged.can_transition_to(Open));
        assert!(Snoozed.can_transition_to(Open));
        for next in [Open, Acknowledged, Resolved, Snoozed] {
            assert!(!Resolved.can_transition_to(next));
        }
    }

    #[test]
    fn test_anomaly_severity_clamped() {
        let now = Utc::now();
        assert_eq!(Anomaly::new("a", "t", 3.2, now, Environment::Aws, 1.0).severity, 1.0);
        assert_eq!(Anomaly::new("a", "t", -1.0, now, Environment::Aws, 1.0).severity, 0.0);
        assert_eq!(Anomaly::new("a", "t", f64::NAN, now, Environment::Aws, 1.0).severity, 0.0);
    }

    #[test]
    fn test_trend_dead_zone() {
        assert_eq!(Trend::classify(130.0, 100.0, 0.2), Trend::Increasing);
        assert_eq!(Trend::classify(110.0, 100.0, 0.2), Trend::Stable);
        assert_eq!(Trend::classify(70.0, 100.0, 0.2), Trend::Decreasing);
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("high_error_rate"), "High Error Rate");
        assert_eq!(title_case("response_time_spike"), "Response Time Spike");
    }
}
