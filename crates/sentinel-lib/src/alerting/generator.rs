//! Anomaly groups to alerts

use crate::models::{title_case, Alert, AlertSeverity, AlertStatus, Anomaly, Context, Environment};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Group key: (api id, anomaly type)
pub type GroupKey = (String, String);

/// Group anomalies by API and type, preserving input order within a group
pub fn group_anomalies(anomalies: Vec<Anomaly>) -> BTreeMap<GroupKey, Vec<Anomaly>> {
    let mut groups: BTreeMap<GroupKey, Vec<Anomaly>> = BTreeMap::new();
    for a in anomalies {
        groups
            .entry((a.api_id.clone(), a.anomaly_type.clone()))
            .or_default()
            .push(a);
    }
    groups
}

/// Stateless alert construction. One alert per non-empty group.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertGenerator;

impl AlertGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate_alerts(&self, groups: &BTreeMap<GroupKey, Vec<Anomaly>>) -> Vec<Alert> {
        self.generate_alerts_at(groups, Utc::now())
    }

    pub fn generate_alerts_at(
        &self,
        groups: &BTreeMap<GroupKey, Vec<Anomaly>>,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        groups
            .iter()
            .filter(|(_, anomalies)| !anomalies.is_empty())
            .map(|((api_id, anomaly_type), anomalies)| {
                build_alert(api_id, anomaly_type, anomalies, now)
            })
            .collect()
    }
}

fn build_alert(api_id: &str, anomaly_type: &str, anomalies: &[Anomaly], now: DateTime<Utc>) -> Alert {
    let max_severity = anomalies.iter().map(|a| a.severity).fold(0.0, f64::max);
    let avg_severity = anomalies.iter().map(|a| a.severity).sum::<f64>() / anomalies.len() as f64;
    let environments: BTreeSet<Environment> = anomalies.iter().map(|a| a.environment).collect();
    let readable = title_case(anomaly_type);
    let api_name = format!("API {api_id}");

    let mut title = if anomalies.len() == 1 {
        format!("{readable} Anomaly Detected in {api_name}")
    } else {
        format!("Multiple {readable} Anomalies Detected in {api_name}")
    };
    match environments.len() {
        0 => {}
        1 => title.push_str(&format!(" ({})", anomalies[0].environment)),
        _ => title.push_str(" (Multiple Environments)"),
    }

    let description = match anomalies {
        [single] => {
            let mut text = single.description.clone();
            if let Some(expected) = single.expected_value {
                text.push_str(&format!(
                    " Current value: {:.2}, Expected: {:.2}.",
                    single.metric_value, expected
                ));
            }
            if let Some(threshold) = single.threshold {
                text.push_str(&format!(" Threshold: {threshold:.2}."));
            }
            text.push_str(&format!(" Environment: {}.", single.environment));
            text
        }
        _ => {
            let envs = if environments.len() == 1 {
                format!("Environment: {}.", anomalies[0].environment)
            } else {
                let names: Vec<&str> = environments.iter().map(Environment::as_str).collect();
                format!("Environments affected: {}.", names.join(", "))
            };
            format!(
                "{} {} anomalies detected in {}. {} Max severity: {:.2}, Average severity: {:.2}.",
                anomalies.len(),
                readable.to_lowercase(),
                api_name,
                envs,
                max_severity,
                avg_severity
            )
        }
    };

    Alert {
        id: format!("alert-{}", uuid::Uuid::new_v4()),
        title,
        description,
        severity: AlertSeverity::from_score(max_severity),
        created_at: now,
        updated_at: now,
        status: AlertStatus::Open,
        anomalies: anomalies.iter().map(|a| a.id.clone()).collect(),
        apis: vec![api_id.to_string()],
        environments: environments.iter().copied().collect(),
        tags: tags(anomaly_type, &environments, anomalies),
        metadata: metadata(anomalies, avg_severity),
        updated_by: None,
    }
}

fn tags(anomaly_type: &str, environments: &BTreeSet<Environment>, anomalies: &[Anomaly]) -> Vec<String> {
    let mut tags = vec![anomaly_type.to_string()];
    tags.extend(environments.iter().map(|env| format!("env:{env}")));
    let leaves: BTreeSet<&str> = anomalies
        .iter()
        .filter_map(Anomaly::endpoint)
        .filter_map(|endpoint| endpoint.rsplit('/').next())
        .filter(|leaf| !leaf.is_empty())
        .collect();
    tags.extend(leaves.into_iter().map(|leaf| format!("endpoint:{leaf}")));
    tags
}

fn metadata(anomalies: &[Anomaly], avg_severity: f64) -> Context {
    let mut meta = Context::new();
    meta.insert("anomaly_count".to_string(), json!(anomalies.len()));
    meta.insert(
        "timestamps".to_string(),
        json!(anomalies.iter().map(|a| a.timestamp.to_rfc3339()).collect::<Vec<_>>()),
    );
    meta.insert(
        "severities".to_string(),
        json!(anomalies.iter().map(|a| a.severity).collect::<Vec<_>>()),
    );
    meta.insert("avg_severity".to_string(), json!(avg_severity));

    let mut endpoints: BTreeMap<String, u64> = BTreeMap::new();
    for a in anomalies {
        if let Some(endpoint) = a.endpoint() {
            let key = format!("{}:{}", a.method().unwrap_or("UNKNOWN"), endpoint);
            *endpoints.entry(key).or_default() += 1;
        }
    }
    if !endpoints.is_empty() {
        let counts = endpoints.into_iter().map(|(k, v)| (k, Value::from(v))).collect();
        meta.insert("affected_endpoints".to_string(), Value::Object(counts));
    }
    meta
}
