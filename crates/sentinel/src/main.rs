//! API Sentinel - API health monitoring daemon
//!
//! Runs the periodic analysis and alerting cycles and serves health,
//! metrics, ingestion and alert lifecycle endpoints.

use anyhow::{Context, Result};
use api_sentinel::{api, config::SentinelConfig};
use sentinel_lib::{
    alerting::AlertManager,
    analyzer::AnalysisSchedulerBuilder,
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    store::MemoryStore,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SENTINEL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting api-sentinel");

    let config = SentinelConfig::load().context("Failed to load configuration")?;
    info!(
        instance = %config.instance,
        analysis_interval_secs = config.analysis_interval_secs,
        alerting_interval_secs = config.alerting_interval_secs,
        "Sentinel configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::ANALYSIS_SCHEDULER).await;
    health_registry.register(components::ALERT_MANAGER).await;
    health_registry.register(components::METRIC_SOURCE).await;
    health_registry.register(components::PERSISTENCE).await;

    let store = Arc::new(MemoryStore::new());

    let scheduler = AnalysisSchedulerBuilder::new()
        .source(store.clone())
        .persistence(store.clone())
        .config(config.analysis_config())
        .health(health_registry.clone())
        .instance(config.instance.clone())
        .build()?;

    let manager = Arc::new(
        AlertManager::new(store.clone(), config.channels()?, config.alerting_config())
            .with_health(health_registry.clone())
            .with_instance(config.instance.clone()),
    );

    let logger = StructuredLogger::new(config.instance.clone());
    logger.log_startup(SENTINEL_VERSION, &manager.channel_names());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));
    let manager_handle = tokio::spawn(manager.clone().run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        manager,
        store,
    ));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    health_registry.set_healthy(components::ANALYSIS_SCHEDULER).await;
    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    let (scheduler_res, manager_res, api_res) =
        tokio::join!(scheduler_handle, manager_handle, api_handle);
    scheduler_res.context("Analysis scheduler task panicked")?;
    manager_res.context("Alert manager task panicked")?;
    if let Err(e) = api_res.context("API server task panicked")? {
        error!(error = %e, "API server exited with error");
    }

    info!("Shutdown complete");
    Ok(())
}
