//! Chat webhook channel (Slack-compatible attachment payload)

use super::{NotificationChannel, CREATED_AT_FORMAT};
use crate::error::NotifyError;
use crate::models::{Alert, AlertSeverity, Environment};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookChannel {
    client: reqwest::Client,
    url: Url,
}

impl WebhookChannel {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let url = Url::parse(url)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    /// Message body posted for `alert`
    pub fn payload(alert: &Alert) -> Value {
        let environments: Vec<&str> = alert.environments.iter().map(Environment::as_str).collect();
        json!({
            "text": format!("*{} Alert*: {}", alert.severity.as_str().to_uppercase(), alert.title),
            "attachments": [{
                "color": severity_color(alert.severity),
                "title": format!("API Alert: {}", alert.title),
                "text": alert.description,
                "fields": [
                    {"title": "Severity", "value": alert.severity.as_str(), "short": true},
                    {"title": "Status", "value": alert.status.as_str(), "short": true},
                    {"title": "API", "value": alert.apis.join(", "), "short": true},
                    {"title": "Environment", "value": environments.join(", "), "short": true},
                    {
                        "title": "Created At",
                        "value": alert.created_at.format(CREATED_AT_FORMAT).to_string(),
                        "short": false
                    }
                ],
                "footer": "API Monitoring System",
                "ts": alert.created_at.timestamp()
            }]
        })
    }
}

fn severity_color(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Critical => "#FF0000",
        AlertSeverity::High => "#FFA500",
        AlertSeverity::Medium => "#FFFF00",
        AlertSeverity::Low => "#00FF00",
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&Self::payload(alert))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(response.status().as_u16()))
        }
    }
}
