// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::error::{EngineError, Result};
use crate::types::{SnapshotValidity, new_id};

use super::{
    BackgroundWorkerRecord, CheckpointRecord, EnvironmentCeilingsRecord, NewRun, NewSnapshot, NewWaitpoint, Persistence,
    QueueRecord, RunRecord, SnapshotRecord, SnapshotWrite, Transition, WaitpointRecord,
    WorkerTaskRecord,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for sharing with the dispatch queue.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create and initialize a SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then runs
    /// all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/runlane.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::database(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                EngineError::database(
                    "connect",
                    format!("Failed to connect to SQLite at {:?}: {}", path, e),
                )
            })?;

        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| EngineError::database("migrate", e))?;

        Ok(Self { pool })
    }
}

async fn insert_snapshot_row(
    conn: &mut SqliteConnection,
    snapshot: &NewSnapshot,
    validity: SnapshotValidity,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO execution_snapshots
            (id, run_id, status, description, validity, checkpoint_id, attempt_number, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&snapshot.id)
    .bind(&snapshot.run_id)
    .bind(snapshot.status.as_str())
    .bind(&snapshot.description)
    .bind(validity.as_str())
    .bind(&snapshot.checkpoint_id)
    .bind(snapshot.attempt_number)
    .bind(snapshot.created_at)
    .execute(&mut *conn)
    .await?;

    attach_waitpoint_rows(conn, &snapshot.id, &snapshot.waitpoint_ids).await
}

async fn attach_waitpoint_rows(
    conn: &mut SqliteConnection,
    snapshot_id: &str,
    waitpoint_ids: &[String],
) -> Result<()> {
    for waitpoint_id in waitpoint_ids {
        sqlx::query(
            r#"
            INSERT INTO snapshot_waitpoints (snapshot_id, waitpoint_id)
            VALUES (?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(snapshot_id)
        .bind(waitpoint_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_block_rows(
    conn: &mut SqliteConnection,
    run_id: &str,
    waitpoint_ids: &[String],
    blocking_snapshot_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    for waitpoint_id in waitpoint_ids {
        sqlx::query(
            r#"
            INSERT INTO run_blocks (run_id, waitpoint_id, blocking_snapshot_id, created_at, released_at)
            VALUES (?, ?, ?, ?, NULL)
            ON CONFLICT (run_id, waitpoint_id) DO UPDATE
            SET blocking_snapshot_id = excluded.blocking_snapshot_id,
                created_at = excluded.created_at,
                released_at = NULL
            WHERE run_blocks.released_at IS NOT NULL
            "#,
        )
        .bind(run_id)
        .bind(waitpoint_id)
        .bind(blocking_snapshot_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_run(&self, run: &NewRun, snapshot: &NewSnapshot) -> Result<RunRecord> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO runs
                (id, friendly_id, environment_id, project_id, task_identifier, queue_name,
                 worker_queue, concurrency_key, payload, status, current_snapshot_id,
                 attempt_number, parent_run_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.friendly_id)
        .bind(&run.environment_id)
        .bind(&run.project_id)
        .bind(&run.task_identifier)
        .bind(&run.queue_name)
        .bind(&run.worker_queue)
        .bind(&run.concurrency_key)
        .bind(&run.payload)
        .bind(snapshot.status.as_str())
        .bind(&snapshot.id)
        .bind(snapshot.attempt_number)
        .bind(&run.parent_run_id)
        .bind(run.created_at)
        .bind(run.created_at)
        .execute(&mut *tx)
        .await?;

        insert_snapshot_row(&mut tx, snapshot, SnapshotValidity::Valid).await?;

        let record = sqlx::query_as::<_, RunRecord>("SELECT * FROM runs WHERE id = ?")
            .bind(&run.id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let record = sqlx::query_as::<_, RunRecord>("SELECT * FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn get_run_by_friendly_id(&self, friendly_id: &str) -> Result<Option<RunRecord>> {
        let record = sqlx::query_as::<_, RunRecord>("SELECT * FROM runs WHERE friendly_id = ?")
            .bind(friendly_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn set_run_queue(&self, run_id: &str, queue_name: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE runs SET queue_name = ?, updated_at = ? WHERE id = ?")
            .bind(queue_name)
            .bind(Utc::now())
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn write_snapshot(&self, transition: &Transition) -> Result<SnapshotWrite> {
        let snapshot = &transition.snapshot;
        let completed_at = transition.completed.then_some(snapshot.created_at);

        let mut tx = self.pool.begin().await?;

        let swapped = sqlx::query(
            r#"
            UPDATE runs
            SET current_snapshot_id = ?,
                status = ?,
                attempt_number = ?,
                output = COALESCE(?, output),
                error = COALESCE(?, error),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE id = ? AND current_snapshot_id = ?
            "#,
        )
        .bind(&snapshot.id)
        .bind(snapshot.status.as_str())
        .bind(snapshot.attempt_number)
        .bind(&transition.output)
        .bind(&transition.error)
        .bind(completed_at)
        .bind(snapshot.created_at)
        .bind(&snapshot.run_id)
        .bind(&transition.expected_snapshot_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if swapped == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT current_snapshot_id FROM runs WHERE id = ?")
                    .bind(&snapshot.run_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some(current_snapshot_id) = current else {
                return Err(EngineError::RunNotFound {
                    run_id: snapshot.run_id.clone(),
                });
            };

            let superseded = NewSnapshot {
                waitpoint_ids: Vec::new(),
                ..snapshot.clone()
            };
            insert_snapshot_row(&mut tx, &superseded, SnapshotValidity::Superseded).await?;
            tx.commit().await?;

            return Ok(SnapshotWrite::Superseded {
                current_snapshot_id,
            });
        }

        sqlx::query(
            r#"
            UPDATE execution_snapshots
            SET validity = 'historical'
            WHERE run_id = ? AND validity = 'valid'
            "#,
        )
        .bind(&snapshot.run_id)
        .execute(&mut *tx)
        .await?;

        insert_snapshot_row(&mut tx, snapshot, SnapshotValidity::Valid).await?;

        if transition.release_blocks {
            sqlx::query(
                r#"
                UPDATE run_blocks
                SET released_at = ?
                WHERE run_id = ? AND released_at IS NULL
                "#,
            )
            .bind(snapshot.created_at)
            .bind(&snapshot.run_id)
            .execute(&mut *tx)
            .await?;
        }

        insert_block_rows(
            &mut tx,
            &snapshot.run_id,
            &transition.block_waitpoint_ids,
            &snapshot.id,
            snapshot.created_at,
        )
        .await?;

        let record =
            sqlx::query_as::<_, SnapshotRecord>("SELECT * FROM execution_snapshots WHERE id = ?")
                .bind(&snapshot.id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(SnapshotWrite::Applied(record))
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>> {
        let record =
            sqlx::query_as::<_, SnapshotRecord>("SELECT * FROM execution_snapshots WHERE id = ?")
                .bind(snapshot_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    async fn get_latest_snapshot(&self, run_id: &str) -> Result<Option<SnapshotRecord>> {
        let record = sqlx::query_as::<_, SnapshotRecord>(
            r#"
            SELECT * FROM execution_snapshots
            WHERE run_id = ? AND validity = 'valid'
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_snapshots(&self, run_id: &str) -> Result<Vec<SnapshotRecord>> {
        let records = sqlx::query_as::<_, SnapshotRecord>(
            r#"
            SELECT * FROM execution_snapshots
            WHERE run_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn list_snapshots_after(
        &self,
        run_id: &str,
        after_seq: i64,
    ) -> Result<Vec<SnapshotRecord>> {
        let records = sqlx::query_as::<_, SnapshotRecord>(
            r#"
            SELECT * FROM execution_snapshots
            WHERE run_id = ? AND seq > ? AND validity != 'superseded'
            ORDER BY seq ASC
            "#,
        )
        .bind(run_id)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn list_snapshot_waitpoint_ids(&self, snapshot_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT waitpoint_id FROM snapshot_waitpoints
            WHERE snapshot_id = ?
            ORDER BY waitpoint_id
            "#,
        )
        .bind(snapshot_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn attach_snapshot_waitpoints(
        &self,
        snapshot_id: &str,
        waitpoint_ids: &[String],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        attach_waitpoint_rows(&mut tx, snapshot_id, waitpoint_ids).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_runs_waiting_for_deploy(
        &self,
        environment_id: &str,
        task_identifiers: &[String],
        limit: i64,
    ) -> Result<Vec<RunRecord>> {
        if task_identifiers.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT * FROM runs WHERE status = 'WAITING_FOR_DEPLOY' AND environment_id = ",
        );
        builder.push_bind(environment_id);
        builder.push(" AND task_identifier IN (");
        let mut separated = builder.separated(", ");
        for task in task_identifiers {
            separated.push_bind(task);
        }
        separated.push_unseparated(")");
        builder.push(" ORDER BY created_at ASC, id ASC LIMIT ");
        builder.push_bind(limit);

        let records = builder
            .build_query_as::<RunRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn insert_waitpoint(&self, waitpoint: &NewWaitpoint) -> Result<WaitpointRecord> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO waitpoints
                (id, friendly_id, environment_id, project_id, kind, status, idempotency_key,
                 complete_after, completed_by_run_id, output_is_error, created_at)
            VALUES (?, ?, ?, ?, ?, 'PENDING', ?, ?, ?, 0, ?)
            ON CONFLICT (environment_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(&waitpoint.id)
        .bind(&waitpoint.friendly_id)
        .bind(&waitpoint.environment_id)
        .bind(&waitpoint.project_id)
        .bind(waitpoint.kind.as_str())
        .bind(&waitpoint.idempotency_key)
        .bind(waitpoint.complete_after)
        .bind(&waitpoint.completed_by_run_id)
        .bind(waitpoint.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let record = if inserted == 0 {
            sqlx::query_as::<_, WaitpointRecord>(
                "SELECT * FROM waitpoints WHERE environment_id = ? AND idempotency_key = ?",
            )
            .bind(&waitpoint.environment_id)
            .bind(&waitpoint.idempotency_key)
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, WaitpointRecord>("SELECT * FROM waitpoints WHERE id = ?")
                .bind(&waitpoint.id)
                .fetch_one(&self.pool)
                .await?
        };
        Ok(record)
    }

    async fn get_waitpoint(&self, waitpoint_id: &str) -> Result<Option<WaitpointRecord>> {
        let record = sqlx::query_as::<_, WaitpointRecord>("SELECT * FROM waitpoints WHERE id = ?")
            .bind(waitpoint_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn get_waitpoints_by_ids(
        &self,
        waitpoint_ids: &[String],
    ) -> Result<Vec<WaitpointRecord>> {
        if waitpoint_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM waitpoints WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in waitpoint_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");
        builder.push(" ORDER BY id ASC");

        let records = builder
            .build_query_as::<WaitpointRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn complete_waitpoint(
        &self,
        waitpoint_id: &str,
        output: Option<&[u8]>,
        output_is_error: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE waitpoints
            SET status = 'COMPLETED',
                output = ?,
                output_is_error = ?,
                completed_at = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(output)
        .bind(output_is_error)
        .bind(completed_at)
        .bind(waitpoint_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_due_datetime_waitpoints(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WaitpointRecord>> {
        let records = sqlx::query_as::<_, WaitpointRecord>(
            r#"
            SELECT * FROM waitpoints
            WHERE kind = 'DATETIME' AND status = 'PENDING' AND complete_after <= ?
            ORDER BY complete_after ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get_run_waitpoint(&self, run_id: &str) -> Result<Option<WaitpointRecord>> {
        let record = sqlx::query_as::<_, WaitpointRecord>(
            r#"
            SELECT * FROM waitpoints
            WHERE kind = 'RUN' AND completed_by_run_id = ?
            LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn insert_blocks(
        &self,
        run_id: &str,
        waitpoint_ids: &[String],
        blocking_snapshot_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_block_rows(&mut tx, run_id, waitpoint_ids, blocking_snapshot_id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_active_block_waitpoint_ids(&self, run_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT waitpoint_id FROM run_blocks
            WHERE run_id = ? AND released_at IS NULL
            ORDER BY waitpoint_id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn count_pending_blocks(&self, run_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM run_blocks b
            JOIN waitpoints w ON w.id = b.waitpoint_id
            WHERE b.run_id = ? AND b.released_at IS NULL AND w.status = 'PENDING'
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_runs_blocked_on(&self, waitpoint_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT run_id FROM run_blocks
            WHERE waitpoint_id = ? AND released_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .bind(waitpoint_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn save_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
        state: &[u8],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (run_id, checkpoint_id, state, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (run_id, checkpoint_id) DO UPDATE
            SET state = excluded.state, created_at = excluded.created_at
            "#,
        )
        .bind(run_id)
        .bind(checkpoint_id)
        .bind(state)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointRecord>> {
        let record = sqlx::query_as::<_, CheckpointRecord>(
            "SELECT * FROM checkpoints WHERE run_id = ? AND checkpoint_id = ?",
        )
        .bind(run_id)
        .bind(checkpoint_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn upsert_queue(&self, queue: &QueueRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queues
                (environment_id, name, kind, requested_limit, concurrency_limit,
                 rate_limit_count, rate_limit_period_ms, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (environment_id, name) DO UPDATE
            SET kind = excluded.kind,
                requested_limit = excluded.requested_limit,
                concurrency_limit = excluded.concurrency_limit,
                rate_limit_count = excluded.rate_limit_count,
                rate_limit_period_ms = excluded.rate_limit_period_ms,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&queue.environment_id)
        .bind(&queue.name)
        .bind(&queue.kind)
        .bind(queue.requested_limit)
        .bind(queue.concurrency_limit)
        .bind(queue.rate_limit_count)
        .bind(queue.rate_limit_period_ms)
        .bind(queue.created_at)
        .bind(queue.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_queue(&self, environment_id: &str, name: &str) -> Result<Option<QueueRecord>> {
        let record = sqlx::query_as::<_, QueueRecord>(
            "SELECT * FROM queues WHERE environment_id = ? AND name = ?",
        )
        .bind(environment_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn set_queue_concurrency_limit(
        &self,
        environment_id: &str,
        name: &str,
        requested_limit: Option<i64>,
        limit: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queues
            SET requested_limit = ?, concurrency_limit = ?, updated_at = ?
            WHERE environment_id = ? AND name = ?
            "#,
        )
        .bind(requested_limit)
        .bind(limit)
        .bind(Utc::now())
        .bind(environment_id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_environment_ceilings(&self, ceilings: &EnvironmentCeilingsRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO environment_ceilings
                (environment_id, environment_max, organization_max, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (environment_id) DO UPDATE
            SET environment_max = excluded.environment_max,
                organization_max = excluded.organization_max,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&ceilings.environment_id)
        .bind(ceilings.environment_max)
        .bind(ceilings.organization_max)
        .bind(ceilings.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_environment_ceilings(
        &self,
        environment_id: &str,
    ) -> Result<Option<EnvironmentCeilingsRecord>> {
        let record = sqlx::query_as::<_, EnvironmentCeilingsRecord>(
            "SELECT * FROM environment_ceilings WHERE environment_id = ?",
        )
        .bind(environment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn upsert_background_worker(
        &self,
        environment_id: &str,
        version: &str,
        tasks: &[(String, String)],
    ) -> Result<BackgroundWorkerRecord> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO background_workers (id, environment_id, version, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (environment_id, version) DO NOTHING
            "#,
        )
        .bind(new_id())
        .bind(environment_id)
        .bind(version)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let worker = sqlx::query_as::<_, BackgroundWorkerRecord>(
            "SELECT * FROM background_workers WHERE environment_id = ? AND version = ?",
        )
        .bind(environment_id)
        .bind(version)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM background_worker_tasks WHERE worker_id = ?")
            .bind(&worker.id)
            .execute(&mut *tx)
            .await?;

        for (task_identifier, queue_name) in tasks {
            sqlx::query(
                r#"
                INSERT INTO background_worker_tasks (worker_id, task_identifier, queue_name)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(&worker.id)
            .bind(task_identifier)
            .bind(queue_name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(worker)
    }

    async fn list_worker_tasks(&self, worker_id: &str) -> Result<Vec<WorkerTaskRecord>> {
        let records = sqlx::query_as::<_, WorkerTaskRecord>(
            r#"
            SELECT * FROM background_worker_tasks
            WHERE worker_id = ?
            ORDER BY task_identifier
            "#,
        )
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn find_task_queue(
        &self,
        environment_id: &str,
        task_identifier: &str,
    ) -> Result<Option<String>> {
        let queue_name: Option<String> = sqlx::query_scalar(
            r#"
            SELECT t.queue_name
            FROM background_worker_tasks t
            JOIN background_workers w ON w.id = t.worker_id
            WHERE w.environment_id = ? AND t.task_identifier = ?
            ORDER BY w.created_at DESC, w.id DESC
            LIMIT 1
            "#,
        )
        .bind(environment_id)
        .bind(task_identifier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(queue_name)
    }

    async fn environment_supports_task(
        &self,
        environment_id: &str,
        task_identifier: &str,
    ) -> Result<bool> {
        let supported: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM background_worker_tasks t
                JOIN background_workers w ON w.id = t.worker_id
                WHERE w.environment_id = ? AND t.task_identifier = ?
            )
            "#,
        )
        .bind(environment_id)
        .bind(task_identifier)
        .fetch_one(&self.pool)
        .await?;
        Ok(supported)
    }

    async fn try_acquire_run_lock(
        &self,
        run_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO run_locks (run_id, owner, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT (run_id) DO UPDATE
            SET owner = excluded.owner, expires_at = excluded.expires_at
            WHERE run_locks.expires_at <= ?
            "#,
        )
        .bind(run_id)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_run_lock(&self, run_id: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM run_locks WHERE run_id = ? AND owner = ?")
            .bind(run_id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check_db(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
