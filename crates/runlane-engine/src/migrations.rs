// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for the run engine.
//!
//! Both the engine tables (runs, snapshots, waitpoints, blocks, locks, queues,
//! workers) and the dispatch queue tables ship as embedded migrations, so an
//! embedding product only needs a pool.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::PgPool;
//! use runlane_engine::migrations;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! migrations::run_postgres(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with all engine migrations embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite migrator with all engine migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run PostgreSQL migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Run SQLite migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_sqlite_migrations_are_idempotent() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        super::run_sqlite(&pool).await.unwrap();
        super::run_sqlite(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '\\_%' ESCAPE '\\' AND name != 'sqlite_sequence' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<_> = tables.into_iter().map(|(name,)| name).collect();

        for expected in [
            "background_worker_tasks",
            "background_workers",
            "checkpoints",
            "dispatch_env_limits",
            "dispatch_messages",
            "dispatch_queue_limits",
            "environment_ceilings",
            "execution_snapshots",
            "queues",
            "run_blocks",
            "run_locks",
            "runs",
            "snapshot_waitpoints",
            "waitpoints",
        ] {
            assert!(names.contains(&expected.to_string()), "missing table {expected}");
        }
    }
}
