//! Alert summary command

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_severity, print_info, print_json, print_table, OutputFormat};

#[derive(Tabled)]
struct SeverityRow {
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Active")]
    count: usize,
}

#[derive(Tabled)]
struct ApiRow {
    #[tabled(rename = "API")]
    api_id: String,
    #[tabled(rename = "Active Alerts")]
    active_alerts: usize,
}

const SEVERITY_ORDER: [&str; 4] = ["critical", "high", "medium", "low"];

pub async fn show_summary(
    client: &ApiClient,
    api: Option<String>,
    env: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let summary = client.summary(api.as_deref(), env.as_deref()).await?;

    if format == OutputFormat::Json {
        return print_json(&summary);
    }

    println!("{}", "Alert Summary".bold());
    println!("  Active alerts:        {}", summary.active_alerts);
    println!("  Anomalies (last 1h):  {}", summary.recent_anomalies);
    println!("  Predicted issues:     {}", summary.upcoming_predictions);
    if !summary.environments.is_empty() {
        println!("  Environments:         {}", summary.environments.join(", "));
    }
    println!();

    let rows: Vec<SeverityRow> = SEVERITY_ORDER
        .iter()
        .map(|s| SeverityRow {
            severity: color_severity(s),
            count: summary.by_severity.get(*s).copied().unwrap_or(0),
        })
        .collect();
    print_table(rows);

    if summary.top_apis.is_empty() {
        print_info("No APIs with active alerts");
    } else {
        println!("\n{}", "Most affected APIs".bold());
        print_table(
            summary
                .top_apis
                .iter()
                .map(|a| ApiRow {
                    api_id: a.api_id.clone(),
                    active_alerts: a.active_alerts,
                })
                .collect(),
        );
    }

    Ok(())
}
