//! Usage Governor - agent resource governance daemon
//!
//! Tracks usage, enforces budgets and rate limits, detects consumption
//! anomalies and resolves hierarchical policies for autonomous agents.

use anyhow::Result;
use governor_lib::{
    health::{components, HealthRegistry},
    models::{Anomaly, Budget, Policy},
    scheduler::{Scheduler, SchedulerConfig},
    store::{JsonFileStore, MemoryStore, Store},
    Governor, GovernorConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const GOVERNOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting usage-governor");

    // Load configuration
    let config = config::DaemonConfig::load()?;
    let timezone = config.timezone()?;
    info!(instance = %config.instance_name, timezone = %config.reset_timezone, "Governor configured");

    // Stores: file-backed when a data dir is configured, in-memory otherwise
    let data_dir = config.data_dir.as_ref().map(PathBuf::from);
    let (budget_store, policy_store, anomaly_store): (
        Arc<dyn Store<Budget>>,
        Arc<dyn Store<Policy>>,
        Arc<dyn Store<Anomaly>>,
    ) = match data_dir {
        Some(ref dir) => (
            Arc::new(JsonFileStore::open("budget", dir.join("budgets.json"))?),
            Arc::new(JsonFileStore::open("policy", dir.join("policies.json"))?),
            Arc::new(JsonFileStore::open("anomaly", dir.join("anomalies.json"))?),
        ),
        None => (
            Arc::new(MemoryStore::new("budget")),
            Arc::new(MemoryStore::new("policy")),
            Arc::new(MemoryStore::new("anomaly")),
        ),
    };

    // Wire the core once; components are shared by reference from here on
    let governor = Arc::new(Governor::new(
        GovernorConfig {
            instance: config.instance_name.clone(),
            timezone,
            detection_window: Duration::from_secs(config.detection_window_secs),
            event_log_dir: data_dir.as_ref().map(|d| d.join("events")),
            ..GovernorConfig::default()
        },
        budget_store,
        policy_store,
        anomaly_store,
        Vec::new(),
    ));

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::LEDGER).await;
    health_registry.register(components::BUDGET).await;
    health_registry.register(components::RATE_LIMITER).await;
    health_registry.register(components::ANOMALY).await;
    health_registry.register(components::POLICY).await;
    health_registry.register(components::ALERT_ROUTER).await;
    health_registry.register(components::SCHEDULER).await;

    governor.logger().log_startup(GOVERNOR_VERSION);

    // Background worker for resets, scans, baselines and policy sync
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let scheduler = Scheduler::new(
        governor.clone(),
        SchedulerConfig {
            scan_interval: Duration::from_secs(config.scan_interval_secs),
            baseline_interval: Duration::from_secs(config.baseline_interval_secs),
            policy_sync_interval: Duration::from_secs(config.policy_sync_interval_secs),
            ..SchedulerConfig::default()
        },
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(governor.clone(), health_registry.clone()));

    // Mark governor as ready after initialization
    health_registry.set_ready(true).await;

    // Start the API server
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    governor.logger().log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());
    let _ = scheduler_handle.await;
    api_handle.abort();
    info!("Shutting down");

    Ok(())
}
