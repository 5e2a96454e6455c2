//! # Planning Refresh Daemon
//!
//! Runs the refresh worker and the backfill scanner against PostgreSQL until interrupted.
//! Configuration comes from `PLANNING_REFRESH_CONFIG` (or the default path) plus
//! `PLANNING_REFRESH__*` environment overrides; `DATABASE_URL` overrides the database URL.

use anyhow::Context;
use planning_refresh::config::ConfigManager;
use planning_refresh::database::{DatabaseConnection, DatabaseMigrations, PgRefreshStore};
use planning_refresh::fetch::ReqwestFeedClient;
use planning_refresh::logging::init_structured_logging;
use planning_refresh::orchestration::RefreshSystem;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let manager = ConfigManager::load().context("failed to load configuration")?;
    let config = manager.config();
    config.validate().context("invalid configuration")?;
    init_structured_logging(&config.logging);

    info!(
        environment = manager.environment(),
        source = ?manager.source_path(),
        "Starting planning refresh daemon"
    );

    let connection = DatabaseConnection::connect(&config.database)
        .await
        .context("failed to connect to PostgreSQL")?;
    if config.database.run_migrations {
        DatabaseMigrations::run_all(connection.pool())
            .await
            .context("failed to apply migrations")?;
    }

    let store = Arc::new(PgRefreshStore::new(connection.pool().clone()));
    let client = Arc::new(ReqwestFeedClient::new(&config.fetch)?);
    let system = RefreshSystem::build(config, store, client)?;
    system.start();

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(error = %error, "Failed to listen for shutdown signal");
    }

    info!("Shutdown requested, stopping background jobs");
    system.stop().await;
    match system.snapshot().await {
        Ok(snapshot) => info!(
            queue_depth = snapshot.queue_depth,
            ready = snapshot.ready,
            disabled = snapshot.disabled,
            "Final queue snapshot"
        ),
        Err(error) => error!(error = %error, "Final queue snapshot failed"),
    }
    connection.close().await;
    Ok(())
}
