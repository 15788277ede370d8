//! PledgeVault Backend Server
//!
//! Boot sequence: configuration, tracing, database pool + migrations, the
//! domain event bus and its audit subscriber, then the long-running warning
//! and reconciliation loops. Runs until Ctrl+C or SIGTERM.

use std::sync::Arc;

use tokio::signal;

use pledgevault_server::anchor::SorobanAnchor;
use pledgevault_server::config::Config;
use pledgevault_server::events::{self, EventBus};
use pledgevault_server::db;
use pledgevault_server::pledge::PledgeWorkflowService;
use pledgevault_server::warning::WarningEngine;

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .init();

    tracing::info!(
        environment = config.environment.as_str(),
        pledge_ratio_bps = config.pledge_ratio_bps,
        "Starting PledgeVault server"
    );

    // Database pool and migrations
    let pool = match db::create_pool(&config).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = db::run_migrations(&pool).await {
        tracing::error!("Failed to run migrations: {}", e);
        std::process::exit(1);
    }

    // Domain event bus with the audit-trail subscriber attached
    let events = EventBus::new(config.event_bus_capacity);
    tokio::spawn(events::run_audit_subscriber(events.subscribe()));

    // Chain anchor
    let anchor = Arc::new(SorobanAnchor::new(
        config.anchor_rpc_url.clone(),
        config.anchor_contract_id.clone(),
        config.anchor_receipt_timeout(),
        config.anchor_poll_interval(),
    ));

    // Services
    let pledge_workflow = PledgeWorkflowService::new(
        pool.clone(),
        anchor,
        events.clone(),
        config.pledge_ratio_bps,
    );
    let warning_engine = WarningEngine::new(pool.clone(), events.clone());

    // Background loops
    let scan_interval = std::time::Duration::from_secs(config.warning_scan_interval_secs);
    tokio::spawn(async move {
        warning_engine.run_scan_loop(scan_interval).await;
    });

    let reconcile_interval = std::time::Duration::from_secs(config.reconcile_interval_secs);
    let reconcile_grace = chrono::Duration::seconds(config.reconcile_grace_secs);
    let reconciler = pledge_workflow.clone();
    tokio::spawn(async move {
        reconciler
            .run_reconcile_loop(reconcile_interval, reconcile_grace)
            .await;
    });

    tracing::info!("PledgeVault server running");

    shutdown_signal().await;

    tracing::info!("Shutdown complete");
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
