//! HTTP API: health, Prometheus metrics, metric ingestion and alert lifecycle

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};
use sentinel_lib::{
    alerting::{AlertManager, LifecycleOutcome},
    error::{AlertError, StoreError},
    health::{ComponentStatus, HealthRegistry},
    store::MemoryStore,
    Alert, ApiSourceConfig, Environment, Metric,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Actor recorded when a request does not name one
pub const DEFAULT_ACTOR: &str = "api";

/// Smallest per-source sample minimum the analyzers can work with
pub const MIN_SOURCE_DATA_POINTS: usize = 2;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub manager: Arc<AlertManager>,
    pub store: Arc<MemoryStore>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        manager: Arc<AlertManager>,
        store: Arc<MemoryStore>,
    ) -> Self {
        Self {
            health_registry,
            manager,
            store,
        }
    }
}

/// Error responses. Internal causes are logged where they occur.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable,
    Internal,
}

impl From<AlertError> for ApiError {
    fn from(err: AlertError) -> Self {
        match err {
            AlertError::NotFound(id) => ApiError::NotFound(format!("alert not found: {id}")),
            AlertError::InvalidArgument(_) | AlertError::InvalidTransition { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            AlertError::OperationFailed => ApiError::Internal,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable => ApiError::Unavailable,
            StoreError::NotFound { kind, id } => ApiError::NotFound(format!("{kind} not found: {id}")),
            other => {
                warn!(error = %other, "Store operation failed");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "persistence unavailable".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| {
            warn!(error = %e, "Failed to encode metrics");
            ApiError::Internal
        })?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    ))
}

async fn ingest_metrics(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<Vec<Metric>>,
) -> Result<impl IntoResponse, ApiError> {
    let ingested = state.store.ingest_metrics(batch)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "ingested": ingested }))))
}

#[derive(Debug, Deserialize)]
pub struct SourceRequest {
    pub name: String,
    pub environment: Environment,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub min_data_points: Option<usize>,
}

fn default_true() -> bool {
    true
}

async fn upsert_source(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SourceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(min) = req.min_data_points {
        if min < MIN_SOURCE_DATA_POINTS {
            return Err(ApiError::BadRequest(format!(
                "min_data_points must be at least {MIN_SOURCE_DATA_POINTS}, got {min}"
            )));
        }
    }
    let source = ApiSourceConfig {
        id,
        name: req.name,
        environment: req.environment,
        is_active: req.is_active,
        updated_at: Utc::now(),
        min_data_points: req.min_data_points,
    };
    state.store.upsert_source(source.clone())?;
    info!(api_id = %source.id, environment = %source.environment, active = source.is_active, "API source updated");
    Ok(Json(source))
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertQuery {
    pub api_id: Option<String>,
    pub environment: Option<Environment>,
}

async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertQuery>,
) -> impl IntoResponse {
    Json(
        state
            .manager
            .get_active_alerts(query.api_id.as_deref(), query.environment)
            .await,
    )
}

async fn summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state
        .manager
        .summary(query.api_id.as_deref(), query.environment)
        .await?;
    Ok(Json(summary))
}

#[derive(Debug, Default, Deserialize)]
pub struct LifecycleRequest {
    #[serde(default)]
    pub actor: Option<String>,
    /// Snooze only
    #[serde(default)]
    pub duration_minutes: Option<i64>,
}

impl LifecycleRequest {
    fn actor(&self) -> &str {
        self.actor.as_deref().unwrap_or(DEFAULT_ACTOR)
    }
}

fn lifecycle_response(outcome: LifecycleOutcome) -> Result<Json<Alert>, ApiError> {
    match outcome {
        LifecycleOutcome::Applied(alert) => Ok(Json(alert)),
        LifecycleOutcome::Skipped => Err(ApiError::Unavailable),
    }
}

async fn acknowledge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<LifecycleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    lifecycle_response(state.manager.acknowledge(&id, req.actor()).await?)
}

async fn resolve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<LifecycleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    lifecycle_response(state.manager.resolve(&id, req.actor()).await?)
}

async fn snooze(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<LifecycleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let minutes = req
        .duration_minutes
        .ok_or_else(|| ApiError::BadRequest("duration_minutes is required".to_string()))?;
    lifecycle_response(state.manager.snooze(&id, minutes, req.actor()).await?)
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/metrics", post(ingest_metrics))
        .route("/v1/sources/:id", put(upsert_source))
        .route("/v1/alerts", get(list_alerts))
        .route("/v1/alerts/:id/acknowledge", post(acknowledge))
        .route("/v1/alerts/:id/resolve", post(resolve))
        .route("/v1/alerts/:id/snooze", post(snooze))
        .route("/v1/summary", get(summary))
        .with_state(state)
}

/// Serve until the shutdown signal fires
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
