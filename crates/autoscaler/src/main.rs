//! Fleet Autoscaler - cluster scaling daemon
//!
//! Runs the reconciliation loop against a Kubernetes cluster and a fleet
//! provisioning API, and serves health, metrics and status over HTTP.

use anyhow::{Context, Result};
use autoscaler_lib::{
    HealthRegistry, ReconcilerBuilder, ScalerMetrics, ScalerStatus, StructuredLogger,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod http_provisioner;
mod kube_orchestrator;
mod quantity;

use http_provisioner::{HttpProvisioner, LaunchScope};
use kube_orchestrator::KubeOrchestrator;

const AUTOSCALER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so verbosity can seed the log filter
    let config = config::AppConfig::load()?;

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.verbosity)),
        )
        .with(fmt::layer().json())
        .init();

    info!(
        cluster_id = %config.scaler.cluster_id,
        policy = config.scaler.scaling_policy.as_str(),
        "Starting fleet-autoscaler"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let orchestrator = Arc::new(KubeOrchestrator::new(
        client,
        config.scaler.system_namespace.clone(),
        config.status_configmap.clone(),
        config.status_namespace.clone(),
    ));

    let scope = LaunchScope {
        region: config.scaler.region.clone(),
        account: config.scaler.account.clone(),
        cluster_id: config.scaler.cluster_id.clone(),
    };
    let provisioner = Arc::new(HttpProvisioner::new(
        &config.provisioner_endpoint,
        scope,
        config.scaler.call_timeout(),
    )?);

    // Initialize metrics
    ScalerMetrics::new();

    let health_registry = HealthRegistry::for_tick_interval(config.scaler.tick_interval());
    let status = ScalerStatus::new(
        config.scaler.cluster_id.clone(),
        config.scaler.scaling_policy.as_str(),
    )
    .handle();

    let logger = StructuredLogger::new(config.scaler.cluster_id.clone());
    logger.log_startup(AUTOSCALER_VERSION, config.scaler.scaling_policy.as_str());

    let reconciler = ReconcilerBuilder::new()
        .orchestrator(orchestrator)
        .provisioner(provisioner)
        .config(config.scaler.clone())
        .health(health_registry.clone())
        .status(status.clone())
        .build()
        .context("Failed to build reconciler")?;

    // Start health, metrics and status server
    let app_state = Arc::new(api::AppState::new(health_registry, status));
    let api_port = config.api_port;
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state).await {
            error!(error = %e, "API server stopped");
        }
    });

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let loop_handle = tokio::spawn(reconciler.run(shutdown_rx));

    let reason = shutdown_signal().await;
    logger.log_shutdown(reason);
    let _ = shutdown_tx.send(());

    // Let an in-progress tick finish
    loop_handle.await.context("Reconciliation loop panicked")?;
    info!("Shutdown complete");

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
