// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runlane-engine integration tests.
//!
//! SQLite engines run everywhere; PostgreSQL engines need TEST_DATABASE_URL.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use runlane_engine::dispatch::{DispatchQueue, PostgresDispatchQueue, SqliteDispatchQueue};
use runlane_engine::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use runlane_engine::{
    Engine, EngineConfig, TaskRegistration, TriggerRunRequest, WorkerRegistration, migrations,
};

pub const TEST_PROJECT: &str = "proj-test";

/// Engine tunables with short waits so failing tests fail fast.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        lock_acquire_timeout: Duration::from_secs(5),
        lock_retry_delay: Duration::from_millis(5),
        deploy_stagger: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

/// Persistence and dispatch backed by one in-memory SQLite database.
pub async fn sqlite_backends() -> (Arc<dyn Persistence>, Arc<dyn DispatchQueue>) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open SQLite database");
    migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run SQLite migrations");
    (
        Arc::new(SqlitePersistence::new(pool.clone())),
        Arc::new(SqliteDispatchQueue::new(pool)),
    )
}

pub async fn sqlite_engine(config: EngineConfig) -> Engine {
    let (persistence, dispatch) = sqlite_backends().await;
    Engine::new(persistence, dispatch, config)
}

/// Engine on TEST_DATABASE_URL, or `None` when it is not set.
pub async fn postgres_engine(config: EngineConfig) -> Option<Engine> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    migrations::run_postgres(&pool).await.ok()?;
    Some(Engine::new(
        Arc::new(PostgresPersistence::new(pool.clone())),
        Arc::new(PostgresDispatchQueue::new(pool)),
        config,
    ))
}

/// Environment id unique to one test, so tests sharing a database stay apart.
pub fn unique_env() -> String {
    format!("env-{}", Uuid::new_v4())
}

/// Register a worker for `task` and wait for the deploy resume to finish.
pub async fn register_task(engine: &Engine, environment_id: &str, task: &str, limit: Option<i64>) {
    let registered = engine
        .register_worker(WorkerRegistration {
            environment_id: environment_id.to_string(),
            version: "20250301.1".to_string(),
            tasks: vec![TaskRegistration {
                task_identifier: task.to_string(),
                concurrency_limit: limit,
                ..Default::default()
            }],
            ..Default::default()
        })
        .await
        .expect("Failed to register worker");
    registered
        .resume
        .await
        .expect("Deploy resume panicked")
        .expect("Deploy resume failed");
}

pub fn trigger(environment_id: &str, task: &str) -> TriggerRunRequest {
    TriggerRunRequest {
        environment_id: environment_id.to_string(),
        project_id: TEST_PROJECT.to_string(),
        task_identifier: task.to_string(),
        payload: br#"{"order":42}"#.to_vec(),
        ..Default::default()
    }
}

/// Trigger, dequeue and start one run. Returns the run id and its EXECUTING snapshot id.
pub async fn executing_run(engine: &Engine, environment_id: &str) -> (String, String) {
    register_task(engine, environment_id, "orders/sync", None).await;
    let run = engine
        .trigger_run(trigger(environment_id, "orders/sync"))
        .await
        .expect("Failed to trigger run");

    let dequeued = engine
        .dequeue_from_worker_queue("consumer-1", environment_id, Some(1))
        .await
        .expect("Failed to dequeue");
    assert_eq!(dequeued.len(), 1, "expected the run to be dequeued");
    assert_eq!(dequeued[0].run.id, run.id);

    let attempt = engine
        .start_run_attempt(&run.id, &dequeued[0].snapshot_id)
        .await
        .expect("Failed to start attempt");
    (run.id, attempt.snapshot.id)
}

/// Poll until the run reaches `status` or the timeout passes.
pub async fn wait_for_status(engine: &Engine, run_id: &str, status: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if engine
            .get_run(run_id)
            .await
            .is_ok_and(|run| run.status == status)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Skip test if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
