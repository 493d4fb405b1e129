//! SMTP email channel

use super::{NotificationChannel, CREATED_AT_FORMAT};
use crate::error::NotifyError;
use crate::models::{Alert, Environment};
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub recipients: Vec<String>,
    pub timeout: Duration,
}

pub struct EmailChannel {
    settings: EmailSettings,
}

impl EmailChannel {
    pub fn new(settings: EmailSettings) -> Self {
        Self { settings }
    }

    pub fn subject(alert: &Alert) -> String {
        format!("{} Alert: {}", alert.severity.as_str().to_uppercase(), alert.title)
    }

    /// Build the multipart message, failing on empty or malformed addresses
    pub fn compose(&self, alert: &Alert) -> Result<Message, NotifyError> {
        if self.settings.recipients.is_empty() {
            return Err(NotifyError::NoRecipients);
        }
        let from: Mailbox = self
            .settings
            .from
            .parse()
            .map_err(|e| NotifyError::Email(format!("invalid sender address: {e}")))?;
        let mut builder = Message::builder().from(from).subject(Self::subject(alert));
        for recipient in &self.settings.recipients {
            let to: Mailbox = recipient
                .parse()
                .map_err(|e| NotifyError::Email(format!("invalid recipient {recipient}: {e}")))?;
            builder = builder.to(to);
        }
        let (text, html) = bodies(alert);
        builder
            .multipart(MultiPart::alternative_plain_html(text, html))
            .map_err(|e| NotifyError::Email(e.to_string()))
    }

    fn transport(&self) -> Result<SmtpTransport, NotifyError> {
        let transport = SmtpTransport::starttls_relay(&self.settings.host)
            .map_err(|e| NotifyError::Email(e.to_string()))?
            .port(self.settings.port)
            .credentials(Credentials::new(
                self.settings.username.clone(),
                self.settings.password.clone(),
            ))
            .timeout(Some(self.settings.timeout))
            .build();
        Ok(transport)
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError> {
        let message = self.compose(alert)?;
        let transport = self.transport()?;
        // lettre's SmtpTransport is blocking
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| NotifyError::Email(format!("send task failed: {e}")))?
            .map_err(|e| NotifyError::Email(e.to_string()))?;
        Ok(())
    }
}

fn bodies(alert: &Alert) -> (String, String) {
    let apis = alert.apis.join(", ");
    let environments = alert
        .environments
        .iter()
        .map(Environment::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let created = alert.created_at.format(CREATED_AT_FORMAT);
    let severity = alert.severity.as_str();

    let text = format!(
        "API Monitoring System Alert\n\n\
         {title}\n\n\
         Alert ID: {id}\n\
         Severity: {severity}\n\
         Status: {status}\n\
         API: {apis}\n\
         Environment: {environments}\n\
         Created At: {created}\n\n\
         Description:\n{description}\n\n\
         This is an automated alert from the API Monitoring System.\n",
        title = alert.title,
        id = alert.id,
        status = alert.status,
        description = alert.description,
    );

    let html = format!(
        "<html><body style=\"font-family: Arial, sans-serif\">\
         <h2>API Monitoring System Alert</h2>\
         <div class=\"alert-{severity}\">\
         <h3>{title}</h3>\
         <p><strong>Alert ID:</strong> {id}</p>\
         <p><strong>Severity:</strong> {severity}</p>\
         <p><strong>Status:</strong> {status}</p>\
         <p><strong>API:</strong> {apis}</p>\
         <p><strong>Environment:</strong> {environments}</p>\
         <p><strong>Created At:</strong> {created}</p>\
         <p><strong>Description:</strong><br>{description}</p>\
         </div>\
         <p style=\"font-size: 12px; color: #6c757d\">This is an automated alert from the API Monitoring System.</p>\
         </body></html>",
        title = escape(&alert.title),
        id = escape(&alert.id),
        status = alert.status,
        description = escape(&alert.description),
    );
    (text, html)
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::super::test_support::alert;
    use super::*;
    use crate::models::AlertSeverity;

    fn settings(recipients: Vec<&str>) -> EmailSettings {
        EmailSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            username: "sentinel".to_string(),
            password: "secret".to_string(),
            from: "sentinel@example.com".to_string(),
            recipients: recipients.into_iter().map(String::from).collect(),
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_subject() {
        assert_eq!(
            EmailChannel::subject(&alert(AlertSeverity::Critical)),
            "CRITICAL Alert: Spike in API orders"
        );
    }

    #[test]
    fn test_compose_multipart_message() {
        let channel = EmailChannel::new(settings(vec!["ops@example.com", "sre@example.com"]));
        let message = channel.compose(&alert(AlertSeverity::High)).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("Subject: HIGH Alert: Spike in API orders"));
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/html"));
        assert!(raw.contains("ops@example.com"));
        assert!(raw.contains("sre@example.com"));
    }

    #[test]
    fn test_html_body_is_escaped() {
        let mut a = alert(AlertSeverity::High);
        a.description = "<script>x</script>".to_string();
        let (text, html) = bodies(&a);
        assert!(text.contains("<script>x</script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[tokio::test]
    async fn test_no_recipients_is_not_sent() {
        let channel = EmailChannel::new(settings(Vec::new()));
        let a = alert(AlertSeverity::Critical);
        assert!(matches!(channel.deliver(&a).await, Err(NotifyError::NoRecipients)));
        assert!(!channel.send_alert(&a).await);
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_failure() {
        let channel = EmailChannel::new(settings(vec!["ops@example.com"]));
        assert!(!channel.send_alert(&alert(AlertSeverity::Critical)).await);
    }
}
