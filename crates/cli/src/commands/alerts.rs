//! Alert listing and lifecycle commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{Alert, ApiClient};
use crate::output::{
    color_severity, color_status, format_timestamp, print_json, print_success, print_table,
    print_warning, truncate, OutputFormat,
};

/// Row for the alerts table
#[derive(Tabled)]
struct AlertRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "API")]
    apis: String,
    #[tabled(rename = "Env")]
    environments: String,
    #[tabled(rename = "Title")]
    title: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<&Alert> for AlertRow {
    fn from(a: &Alert) -> Self {
        Self {
            id: truncate(&a.id, 18),
            severity: color_severity(&a.severity),
            status: color_status(&a.status),
            apis: a.apis.join(", "),
            environments: a.environments.join(", "),
            title: truncate(&a.title, 60),
            created_at: format_timestamp(&a.created_at),
        }
    }
}

/// List active (open or acknowledged) alerts
pub async fn list_alerts(
    client: &ApiClient,
    api: Option<String>,
    env: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let alerts = client.list_alerts(api.as_deref(), env.as_deref()).await?;

    match format {
        OutputFormat::Json => print_json(&alerts)?,
        OutputFormat::Table => {
            if alerts.is_empty() {
                print_warning("No active alerts");
                return Ok(());
            }
            print_table(alerts.iter().map(AlertRow::from).collect());
            println!("\nTotal: {} active alerts", alerts.len());
        }
    }

    Ok(())
}

/// Lifecycle action applied to a single alert
#[derive(Debug, Clone, Copy)]
pub enum Action {
    Acknowledge,
    Resolve,
    Snooze { minutes: i64 },
}

pub async fn update_alert(
    client: &ApiClient,
    id: &str,
    action: Action,
    actor: &str,
    format: OutputFormat,
) -> Result<()> {
    let alert = match action {
        Action::Acknowledge => client.acknowledge(id, actor).await?,
        Action::Resolve => client.resolve(id, actor).await?,
        Action::Snooze { minutes } => {
            if minutes <= 0 {
                anyhow::bail!("Snooze duration must be positive");
            }
            client.snooze(id, minutes, actor).await?
        }
    };

    match format {
        OutputFormat::Json => print_json(&alert)?,
        OutputFormat::Table => {
            let detail = match action {
                Action::Snooze { minutes } => format!(" for {minutes} minutes"),
                _ => String::new(),
            };
            print_success(&format!(
                "Alert {} is now {}{} (by {})",
                alert.id,
                color_status(&alert.status),
                detail,
                actor
            ));
        }
    }

    Ok(())
}
