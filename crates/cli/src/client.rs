//! HTTP client for the sentinel daemon API

use anyhow::{Context, Result};
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// API client for the sentinel daemon
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// GET `path` with the non-empty query parameters
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, Option<&str>)]) -> Result<T> {
        let mut url = self.base_url.join(path).context("Invalid path")?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                if let Some(value) = value {
                    pairs.append_pair(key, value);
                }
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;
        Self::parse(response).await
    }

    /// POST a JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .context("Failed to send request")?;
        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            anyhow::bail!("API error ({}): {}", status, message);
        }
        response.json().await.context("Failed to parse response")
    }

    pub async fn list_alerts(&self, api_id: Option<&str>, environment: Option<&str>) -> Result<Vec<Alert>> {
        self.get("v1/alerts", &[("api_id", api_id), ("environment", environment)])
            .await
    }

    pub async fn summary(&self, api_id: Option<&str>, environment: Option<&str>) -> Result<Summary> {
        self.get("v1/summary", &[("api_id", api_id), ("environment", environment)])
            .await
    }

    pub async fn acknowledge(&self, id: &str, actor: &str) -> Result<Alert> {
        self.post(
            &format!("v1/alerts/{id}/acknowledge"),
            &LifecycleRequest::by(actor),
        )
        .await
    }

    pub async fn resolve(&self, id: &str, actor: &str) -> Result<Alert> {
        self.post(&format!("v1/alerts/{id}/resolve"), &LifecycleRequest::by(actor))
            .await
    }

    pub async fn snooze(&self, id: &str, duration_minutes: i64, actor: &str) -> Result<Alert> {
        let request = LifecycleRequest {
            duration_minutes: Some(duration_minutes),
            ..LifecycleRequest::by(actor)
        };
        self.post(&format!("v1/alerts/{id}/snooze"), &request).await
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub title: String,
    pub description: String,
    pub severity: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    pub apis: Vec<String>,
    pub environments: Vec<String>,
    #[serde(default)]
    pub anomalies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiAlertCount {
    pub api_id: String,
    pub active_alerts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub active_alerts: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub recent_anomalies: usize,
    pub upcoming_predictions: usize,
    pub environments: Vec<String>,
    pub top_apis: Vec<ApiAlertCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleRequest {
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
}

impl LifecycleRequest {
    fn by(actor: &str) -> Self {
        Self {
            actor: actor.to_string(),
            duration_minutes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn alert_json(status: &str) -> serde_json::Value {
        json!({
            "id": "alert-1",
            "title": "High Error Rate Anomaly Detected in API orders (aws)",
            "description": "High error rate detected",
            "severity": "high",
            "status": status,
            "created_at": "2024-05-06T12:30:00Z",
            "updated_at": "2024-05-06T12:30:00Z",
            "apis": ["orders"],
            "environments": ["aws"],
            "anomalies": ["an-1"],
            "tags": ["high_error_rate"],
            "metadata": {"anomaly_count": 1}
        })
    }

    #[tokio::test]
    async fn test_list_alerts_sends_filters() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/alerts")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("api_id".into(), "orders".into()),
                Matcher::UrlEncoded("environment".into(), "aws".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!([alert_json("open")]).to_string())
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let alerts = client.list_alerts(Some("orders"), Some("aws")).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, "high");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_snooze_posts_duration_and_actor() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/alerts/alert-1/snooze")
            .match_body(Matcher::Json(json!({"actor": "ops", "duration_minutes": 30})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(alert_json("snoozed").to_string())
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let alert = client.snooze("alert-1", 30, "ops").await.unwrap();
        assert_eq!(alert.status, "snoozed");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_body_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/alerts/alert-9/resolve")
            .with_status(404)
            .with_body(json!({"error": "alert not found: alert-9"}).to_string())
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client.resolve("alert-9", "cli-user").await.unwrap_err();
        assert_eq!(err.to_string(), "API error (404 Not Found): alert not found: alert-9");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(ApiClient::new("not a url").is_err());
    }
}
