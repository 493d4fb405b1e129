//! Observability for the sentinel
//!
//! Provides:
//! - Prometheus metrics (cycle latency, analysis output, alert and notification counts)
//! - Event-typed structured logging with tracing

use crate::models::{Alert, AlertSeverity, AlertStatus, Anomaly, Prediction};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for cycle durations (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

static GLOBAL_METRICS: OnceLock<SentinelMetricsInner> = OnceLock::new();

struct SentinelMetricsInner {
    analysis_cycle_seconds: Histogram,
    alerting_cycle_seconds: Histogram,
    anomalies_detected: IntCounter,
    predictions_generated: IntCounter,
    alerts_generated: IntCounter,
    notifications_sent: IntCounterVec,
    notifications_failed: IntCounterVec,
    monitored_apis: IntGauge,
    cycle_errors: IntCounter,
}

impl SentinelMetricsInner {
    fn new() -> Self {
        Self {
            analysis_cycle_seconds: register_histogram!(
                "api_sentinel_analysis_cycle_seconds",
                "Time spent running one analysis cycle over all APIs",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register analysis_cycle_seconds"),

            alerting_cycle_seconds: register_histogram!(
                "api_sentinel_alerting_cycle_seconds",
                "Time spent turning unprocessed anomalies into alerts",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register alerting_cycle_seconds"),

            anomalies_detected: register_int_counter!(
                "api_sentinel_anomalies_detected_total",
                "Total number of anomalies detected"
            )
            .expect("Failed to register anomalies_detected"),

            predictions_generated: register_int_counter!(
                "api_sentinel_predictions_generated_total",
                "Total number of predictions generated"
            )
            .expect("Failed to register predictions_generated"),

            alerts_generated: register_int_counter!(
                "api_sentinel_alerts_generated_total",
                "Total number of alerts generated"
            )
            .expect("Failed to register alerts_generated"),

            notifications_sent: register_int_counter_vec!(
                "api_sentinel_notifications_sent_total",
                "Notifications delivered, by channel",
                &["channel"]
            )
            .expect("Failed to register notifications_sent"),

            notifications_failed: register_int_counter_vec!(
                "api_sentinel_notifications_failed_total",
                "Notification deliveries that failed, by channel",
                &["channel"]
            )
            .expect("Failed to register notifications_failed"),

            monitored_apis: register_int_gauge!(
                "api_sentinel_monitored_apis",
                "Number of APIs with an active analyzer set"
            )
            .expect("Failed to register monitored_apis"),

            cycle_errors: register_int_counter!(
                "api_sentinel_cycle_errors_total",
                "Collaborator failures observed during analysis or alerting cycles"
            )
            .expect("Failed to register cycle_errors"),
        }
    }
}

/// Handle to the process-wide sentinel metrics. Clones share one registry entry.
#[derive(Clone)]
pub struct SentinelMetrics {
    _private: (),
}

impl Default for SentinelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SentinelMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SentinelMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SentinelMetricsInner {
        GLOBAL_METRICS.get_or_init(SentinelMetricsInner::new)
    }

    pub fn observe_analysis_cycle(&self, duration_secs: f64) {
        self.inner().analysis_cycle_seconds.observe(duration_secs);
    }

    pub fn observe_alerting_cycle(&self, duration_secs: f64) {
        self.inner().alerting_cycle_seconds.observe(duration_secs);
    }

    pub fn add_anomalies(&self, count: usize) {
        self.inner().anomalies_detected.inc_by(count as u64);
    }

    pub fn add_predictions(&self, count: usize) {
        self.inner().predictions_generated.inc_by(count as u64);
    }

    pub fn add_alerts(&self, count: usize) {
        self.inner().alerts_generated.inc_by(count as u64);
    }

    pub fn record_notification(&self, channel: &str, delivered: bool) {
        let counter = if delivered {
            &self.inner().notifications_sent
        } else {
            &self.inner().notifications_failed
        };
        counter.with_label_values(&[channel]).inc();
    }

    pub fn set_monitored_apis(&self, count: usize) {
        self.inner().monitored_apis.set(count as i64);
    }

    pub fn inc_cycle_errors(&self) {
        self.inner().cycle_errors.inc();
    }
}

/// Event-typed log records for the sentinel's significant events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_anomaly(&self, anomaly: &Anomaly) {
        let severity = AlertSeverity::from_score(anomaly.severity);
        if severity == AlertSeverity::Critical {
            warn!(
                event = "anomaly_detected",
                instance = %self.instance,
                api_id = %anomaly.api_id,
                anomaly_type = %anomaly.anomaly_type,
                environment = %anomaly.environment,
                severity = anomaly.severity,
                metric_value = anomaly.metric_value,
                "Critical anomaly detected"
            );
        } else {
            info!(
                event = "anomaly_detected",
                instance = %self.instance,
                api_id = %anomaly.api_id,
                anomaly_type = %anomaly.anomaly_type,
                environment = %anomaly.environment,
                severity = anomaly.severity,
                metric_value = anomaly.metric_value,
                "Anomaly detected"
            );
        }
    }

    pub fn log_prediction(&self, prediction: &Prediction) {
        info!(
            event = "prediction_generated",
            instance = %self.instance,
            api_id = %prediction.api_id,
            prediction_type = %prediction.prediction_type,
            environment = %prediction.environment,
            confidence = prediction.confidence,
            predicted_value = prediction.predicted_value,
            predicted_for = %prediction.predicted_for.to_rfc3339(),
            "Generated prediction"
        );
    }

    pub fn log_alert(&self, alert: &Alert) {
        info!(
            event = "alert_generated",
            instance = %self.instance,
            alert_id = %alert.id,
            severity = %alert.severity,
            apis = ?alert.apis,
            anomaly_count = alert.anomalies.len(),
            title = %alert.title,
            "Alert generated"
        );
    }

    pub fn log_transition(&self, alert_id: &str, from: AlertStatus, to: AlertStatus, actor: &str) {
        info!(
            event = "alert_transition",
            instance = %self.instance,
            alert_id = %alert_id,
            from = %from,
            to = %to,
            actor = %actor,
            "Alert status changed"
        );
    }

    pub fn log_startup(&self, version: &str, channels: &[&str]) {
        info!(
            event = "sentinel_started",
            instance = %self.instance,
            version = %version,
            channels = ?channels,
            "API sentinel started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "sentinel_shutdown",
            instance = %self.instance,
            reason = %reason,
            "API sentinel shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Environment;

    #[test]
    fn test_metrics_handle_is_shared() {
        let metrics = SentinelMetrics::new();
        let other = metrics.clone();
        metrics.observe_analysis_cycle(0.2);
        other.observe_alerting_cycle(0.01);
        metrics.add_anomalies(3);
        metrics.record_notification("webhook", true);
        metrics.record_notification("email", false);
        metrics.set_monitored_apis(4);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "api_sentinel_notifications_failed_total"));
    }

    #[test]
    fn test_logger_accepts_events() {
        let logger = StructuredLogger::new("test-instance");
        assert_eq!(logger.instance, "test-instance");
        let anomaly = Anomaly::new("api", "high_error_rate", 0.95, chrono::Utc::now(), Environment::Aws, 0.2);
        logger.log_anomaly(&anomaly);
        logger.log_transition("a1", AlertStatus::Open, AlertStatus::Resolved, "ops");
    }
}
