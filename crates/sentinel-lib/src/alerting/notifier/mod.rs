//! Notification channels for high-severity alerts

mod email;
mod webhook;

pub use email::{EmailChannel, EmailSettings};
pub use webhook::{WebhookChannel, DEFAULT_WEBHOOK_TIMEOUT};

use crate::error::NotifyError;
use crate::models::Alert;
use async_trait::async_trait;
use tracing::{debug, warn};

/// A destination alerts can be pushed to
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError>;

    /// Deliver and report success; failures are logged, never raised
    async fn send_alert(&self, alert: &Alert) -> bool {
        match self.deliver(alert).await {
            Ok(()) => {
                debug!(alert_id = %alert.id, channel = self.name(), "Alert notification sent");
                true
            }
            Err(e) => {
                warn!(
                    event = "notification_failed",
                    alert_id = %alert.id,
                    channel = self.name(),
                    error = %e,
                    "Failed to deliver alert notification"
                );
                false
            }
        }
    }
}

/// Timestamp format shared by message bodies
pub(crate) const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";
