//! Daemon configuration

use anyhow::{bail, Context, Result};
use sentinel_lib::alerting::notifier::{
    EmailChannel, EmailSettings, NotificationChannel, WebhookChannel, DEFAULT_WEBHOOK_TIMEOUT,
};
use sentinel_lib::alerting::AlertingConfig;
use sentinel_lib::analyzer::AnalysisConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Sentinel configuration, read from `SENTINEL_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct SentinelConfig {
    /// Instance name attached to structured log records
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Port for health, metrics and alert endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_analysis_interval")]
    pub analysis_interval_secs: u64,

    #[serde(default = "default_alerting_interval")]
    pub alerting_interval_secs: u64,

    /// Trailing window handed to anomaly detection
    #[serde(default = "default_analysis_window")]
    pub analysis_window_secs: u64,

    /// Per-call limit for metric source and persistence calls
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,

    #[serde(default)]
    pub auto_resume_snoozed: bool,

    #[serde(default)]
    pub webhook_enabled: bool,
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,

    #[serde(default)]
    pub email_enabled: bool,
    pub email_host: Option<String>,
    #[serde(default = "default_email_port")]
    pub email_port: u16,
    pub email_username: Option<String>,
    pub email_password: Option<String>,
    pub email_from: Option<String>,
    /// Comma separated in the environment
    #[serde(default)]
    pub email_recipients: Vec<String>,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "api-sentinel".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_analysis_interval() -> u64 {
    300
}

fn default_alerting_interval() -> u64 {
    60
}

fn default_analysis_window() -> u64 {
    3600
}

fn default_io_timeout() -> u64 {
    30
}

fn default_webhook_timeout() -> u64 {
    DEFAULT_WEBHOOK_TIMEOUT.as_secs()
}

fn default_email_port() -> u16 {
    587
}

impl SentinelConfig {
    /// Load configuration from the process environment
    pub fn load() -> Result<Self> {
        Self::from_source(None)
    }

    /// Load from an explicit variable map instead of the process environment
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        Self::from_source(Some(vars))
    }

    fn from_source(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let env = config::Environment::with_prefix("SENTINEL")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("email_recipients")
            .source(vars);
        let config: SentinelConfig = config::Config::builder()
            .add_source(env)
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.analysis_interval_secs == 0 || self.alerting_interval_secs == 0 {
            bail!("Cycle intervals must be positive");
        }
        if self.analysis_window_secs == 0 {
            bail!("SENTINEL_ANALYSIS_WINDOW_SECS must be positive");
        }
        if self.webhook_enabled && self.webhook_url.is_none() {
            bail!("Webhook channel enabled but SENTINEL_WEBHOOK_URL is not set");
        }
        if self.email_enabled {
            let required = [
                ("SENTINEL_EMAIL_HOST", &self.email_host),
                ("SENTINEL_EMAIL_USERNAME", &self.email_username),
                ("SENTINEL_EMAIL_PASSWORD", &self.email_password),
                ("SENTINEL_EMAIL_FROM", &self.email_from),
            ];
            if let Some((name, _)) = required.iter().find(|(_, value)| value.is_none()) {
                bail!("Email channel enabled but {name} is not set");
            }
            if self.email_recipients.is_empty() {
                bail!("Email channel enabled but SENTINEL_EMAIL_RECIPIENTS is empty");
            }
        }
        Ok(())
    }

    pub fn analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig {
            interval: Duration::from_secs(self.analysis_interval_secs),
            analysis_window: Duration::from_secs(self.analysis_window_secs),
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            ..AnalysisConfig::default()
        }
    }

    pub fn alerting_config(&self) -> AlertingConfig {
        AlertingConfig {
            interval: Duration::from_secs(self.alerting_interval_secs),
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            auto_resume_snoozed: self.auto_resume_snoozed,
        }
    }

    /// Build the enabled notification channels
    pub fn channels(&self) -> Result<Vec<Arc<dyn NotificationChannel>>> {
        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
        if self.webhook_enabled {
            let url = self.webhook_url.as_deref().unwrap_or_default();
            let webhook =
                WebhookChannel::new(url, Duration::from_secs(self.webhook_timeout_secs))
                    .context("Failed to create webhook channel")?;
            channels.push(Arc::new(webhook));
        }
        if self.email_enabled {
            channels.push(Arc::new(EmailChannel::new(EmailSettings {
                host: self.email_host.clone().unwrap_or_default(),
                port: self.email_port,
                username: self.email_username.clone().unwrap_or_default(),
                password: self.email_password.clone().unwrap_or_default(),
                from: self.email_from.clone().unwrap_or_default(),
                recipients: self.email_recipients.clone(),
                timeout: Duration::from_secs(self.io_timeout_secs),
            })));
        }
        Ok(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = SentinelConfig::from_vars(HashMap::new()).unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.analysis_interval_secs, 300);
        assert_eq!(config.alerting_interval_secs, 60);
        assert_eq!(config.analysis_window_secs, 3600);
        assert!(!config.auto_resume_snoozed);
        assert!(config.channels().unwrap().is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = SentinelConfig::from_vars(vars(&[
            ("SENTINEL_ANALYSIS_INTERVAL_SECS", "120"),
            ("SENTINEL_API_PORT", "9000"),
            ("SENTINEL_AUTO_RESUME_SNOOZED", "true"),
        ]))
        .unwrap();
        assert_eq!(config.analysis_config().interval, Duration::from_secs(120));
        assert_eq!(config.api_port, 9000);
        assert!(config.alerting_config().auto_resume_snoozed);
    }

    #[test]
    fn test_enabled_webhook_requires_url() {
        let err = SentinelConfig::from_vars(vars(&[("SENTINEL_WEBHOOK_ENABLED", "true")]))
            .unwrap_err();
        assert!(err.to_string().contains("SENTINEL_WEBHOOK_URL"));

        let config = SentinelConfig::from_vars(vars(&[
            ("SENTINEL_WEBHOOK_ENABLED", "true"),
            ("SENTINEL_WEBHOOK_URL", "https://hooks.example.com/T000/B000"),
        ]))
        .unwrap();
        let channels = config.channels().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name(), "webhook");
    }

    #[test]
    fn test_email_channel_config() {
        let err = SentinelConfig::from_vars(vars(&[
            ("SENTINEL_EMAIL_ENABLED", "true"),
            ("SENTINEL_EMAIL_HOST", "smtp.example.com"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SENTINEL_EMAIL_USERNAME"));

        let config = SentinelConfig::from_vars(vars(&[
            ("SENTINEL_EMAIL_ENABLED", "true"),
            ("SENTINEL_EMAIL_HOST", "smtp.example.com"),
            ("SENTINEL_EMAIL_USERNAME", "sentinel"),
            ("SENTINEL_EMAIL_PASSWORD", "hunter2"),
            ("SENTINEL_EMAIL_FROM", "sentinel@example.com"),
            ("SENTINEL_EMAIL_RECIPIENTS", "ops@example.com,sre@example.com"),
        ]))
        .unwrap();
        assert_eq!(
            config.email_recipients,
            vec!["ops@example.com", "sre@example.com"]
        );
        assert_eq!(config.channels().unwrap()[0].name(), "email");
    }
}
