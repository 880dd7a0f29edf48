// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runlane Engine - Standalone Server
//!
//! Serves the HTTP API and runs the waitpoint sweeper and lease reclaimer
//! against PostgreSQL, or SQLite when `RUNLANE_DATABASE_URL` starts with
//! `sqlite:`.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};

use runlane_engine::config::Config;
use runlane_engine::dispatch::{DispatchQueue, PostgresDispatchQueue, SqliteDispatchQueue};
use runlane_engine::migrations;
use runlane_engine::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use runlane_engine::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runlane_engine=info,tower_http=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        lease_ttl_secs = config.engine.lease_ttl.as_secs(),
        dequeue_strategy = ?config.engine.dequeue_strategy,
        "Starting Runlane Engine"
    );

    let (persistence, dispatch): (Arc<dyn Persistence>, Arc<dyn DispatchQueue>) =
        if config.database_url.starts_with("sqlite:") {
            let options =
                SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await?;
            migrations::run_sqlite(&pool).await?;
            info!("Connected to SQLite database, migrations applied");
            (
                Arc::new(SqlitePersistence::new(pool.clone())),
                Arc::new(SqliteDispatchQueue::new(pool)),
            )
        } else {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&config.database_url)
                .await?;
            migrations::run_postgres(&pool).await?;
            info!("Connected to PostgreSQL database, migrations applied");
            (
                Arc::new(PostgresPersistence::new(pool.clone())),
                Arc::new(PostgresDispatchQueue::new(pool)),
            )
        };

    let runtime = EngineRuntime::builder()
        .config(&config)
        .persistence(persistence)
        .dispatch(dispatch)
        .build()?
        .start()
        .await?;

    if let Some(addr) = runtime.http_addr() {
        info!(addr = %addr, "Runlane Engine ready");
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Runlane Engine shut down");

    Ok(())
}
