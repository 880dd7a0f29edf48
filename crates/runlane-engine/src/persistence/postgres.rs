// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for the run engine.
//!
//! Storage access is written as free functions over a pool (or a connection
//! inside a transaction); [`PostgresPersistence`] delegates to them.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use crate::error::{EngineError, Result};
use crate::types::{SnapshotValidity, new_id};

use super::{
    BackgroundWorkerRecord, CheckpointRecord, EnvironmentCeilingsRecord, NewRun, NewSnapshot, NewWaitpoint, Persistence,
    QueueRecord, RunRecord, SnapshotRecord, SnapshotWrite, Transition, WaitpointRecord,
    WorkerTaskRecord,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for sharing with the dispatch queue.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Runs and snapshots
// ============================================================================

async fn insert_snapshot_row(
    conn: &mut PgConnection,
    snapshot: &NewSnapshot,
    validity: SnapshotValidity,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO execution_snapshots
            (id, run_id, status, description, validity, checkpoint_id, attempt_number, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
    conn: &mut PgConnection,
    snapshot_id: &str,
    waitpoint_ids: &[String],
) -> Result<()> {
    if waitpoint_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"
        INSERT INTO snapshot_waitpoints (snapshot_id, waitpoint_id)
        SELECT $1, UNNEST($2::text[])
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(snapshot_id)
    .bind(waitpoint_ids)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_block_rows(
    conn: &mut PgConnection,
    run_id: &str,
    waitpoint_ids: &[String],
    blocking_snapshot_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    if waitpoint_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"
        INSERT INTO run_blocks (run_id, waitpoint_id, blocking_snapshot_id, created_at, released_at)
        SELECT $1, UNNEST($2::text[]), $3, $4, NULL
        ON CONFLICT (run_id, waitpoint_id) DO UPDATE
        SET blocking_snapshot_id = EXCLUDED.blocking_snapshot_id,
            created_at = EXCLUDED.created_at,
            released_at = NULL
        WHERE run_blocks.released_at IS NOT NULL
        "#,
    )
    .bind(run_id)
    .bind(waitpoint_ids)
    .bind(blocking_snapshot_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert a run together with its first snapshot.
pub async fn insert_run(pool: &PgPool, run: &NewRun, snapshot: &NewSnapshot) -> Result<RunRecord> {
    let mut tx = pool.begin().await?;

    let record = sqlx::query_as::<_, RunRecord>(
        r#"
        INSERT INTO runs
            (id, friendly_id, environment_id, project_id, task_identifier, queue_name,
             worker_queue, concurrency_key, payload, status, current_snapshot_id,
             attempt_number, parent_run_id, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
        RETURNING *
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
    .fetch_one(&mut *tx)
    .await?;

    insert_snapshot_row(&mut tx, snapshot, SnapshotValidity::Valid).await?;

    tx.commit().await?;
    Ok(record)
}

/// Get a run by internal id.
pub async fn get_run(pool: &PgPool, run_id: &str) -> Result<Option<RunRecord>> {
    let record = sqlx::query_as::<_, RunRecord>("SELECT * FROM runs WHERE id = $1")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Get a run by friendly id.
pub async fn get_run_by_friendly_id(pool: &PgPool, friendly_id: &str) -> Result<Option<RunRecord>> {
    let record = sqlx::query_as::<_, RunRecord>("SELECT * FROM runs WHERE friendly_id = $1")
        .bind(friendly_id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Point a run at another queue.
pub async fn set_run_queue(pool: &PgPool, run_id: &str, queue_name: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE runs SET queue_name = $1, updated_at = NOW() WHERE id = $2")
        .bind(queue_name)
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Compare-and-swap the run's current snapshot.
pub async fn write_snapshot(pool: &PgPool, transition: &Transition) -> Result<SnapshotWrite> {
    let snapshot = &transition.snapshot;
    let completed_at = transition.completed.then_some(snapshot.created_at);

    let mut tx = pool.begin().await?;

    let swapped = sqlx::query(
        r#"
        UPDATE runs
        SET current_snapshot_id = $1,
            status = $2,
            attempt_number = $3,
            output = COALESCE($4, output),
            error = COALESCE($5, error),
            completed_at = COALESCE($6, completed_at),
            updated_at = $7
        WHERE id = $8 AND current_snapshot_id = $9
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
            sqlx::query_scalar("SELECT current_snapshot_id FROM runs WHERE id = $1")
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
        WHERE run_id = $1 AND validity = 'valid'
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
            SET released_at = $1
            WHERE run_id = $2 AND released_at IS NULL
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
        sqlx::query_as::<_, SnapshotRecord>("SELECT * FROM execution_snapshots WHERE id = $1")
            .bind(&snapshot.id)
            .fetch_one(&mut *tx)
            .await?;

    tx.commit().await?;
    Ok(SnapshotWrite::Applied(record))
}

/// Get a snapshot by id.
pub async fn get_snapshot(pool: &PgPool, snapshot_id: &str) -> Result<Option<SnapshotRecord>> {
    let record =
        sqlx::query_as::<_, SnapshotRecord>("SELECT * FROM execution_snapshots WHERE id = $1")
            .bind(snapshot_id)
            .fetch_optional(pool)
            .await?;
    Ok(record)
}

/// Get the valid snapshot of a run.
pub async fn get_latest_snapshot(pool: &PgPool, run_id: &str) -> Result<Option<SnapshotRecord>> {
    let record = sqlx::query_as::<_, SnapshotRecord>(
        "SELECT * FROM execution_snapshots WHERE run_id = $1 AND validity = 'valid'",
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// List every snapshot of a run by sequence.
pub async fn list_snapshots(pool: &PgPool, run_id: &str) -> Result<Vec<SnapshotRecord>> {
    let records = sqlx::query_as::<_, SnapshotRecord>(
        "SELECT * FROM execution_snapshots WHERE run_id = $1 ORDER BY seq ASC",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// List non-superseded snapshots after a sequence.
pub async fn list_snapshots_after(
    pool: &PgPool,
    run_id: &str,
    after_seq: i64,
) -> Result<Vec<SnapshotRecord>> {
    let records = sqlx::query_as::<_, SnapshotRecord>(
        r#"
        SELECT * FROM execution_snapshots
        WHERE run_id = $1 AND seq > $2 AND validity <> 'superseded'
        ORDER BY seq ASC
        "#,
    )
    .bind(run_id)
    .bind(after_seq)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// List waitpoint ids attached to a snapshot.
pub async fn list_snapshot_waitpoint_ids(pool: &PgPool, snapshot_id: &str) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT waitpoint_id FROM snapshot_waitpoints WHERE snapshot_id = $1 ORDER BY waitpoint_id",
    )
    .bind(snapshot_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Oldest-first runs parked in WAITING_FOR_DEPLOY.
pub async fn list_runs_waiting_for_deploy(
    pool: &PgPool,
    environment_id: &str,
    task_identifiers: &[String],
    limit: i64,
) -> Result<Vec<RunRecord>> {
    let records = sqlx::query_as::<_, RunRecord>(
        r#"
        SELECT * FROM runs
        WHERE status = 'WAITING_FOR_DEPLOY'
          AND environment_id = $1
          AND task_identifier = ANY($2)
        ORDER BY created_at ASC, id ASC
        LIMIT $3
        "#,
    )
    .bind(environment_id)
    .bind(task_identifiers)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

// ============================================================================
// Waitpoints and blocks
// ============================================================================

/// Insert a waitpoint, returning the stored one on an idempotency key hit.
pub async fn insert_waitpoint(pool: &PgPool, waitpoint: &NewWaitpoint) -> Result<WaitpointRecord> {
    let inserted = sqlx::query_as::<_, WaitpointRecord>(
        r#"
        INSERT INTO waitpoints
            (id, friendly_id, environment_id, project_id, kind, status, idempotency_key,
             complete_after, completed_by_run_id, output_is_error, created_at)
        VALUES ($1, $2, $3, $4, $5, 'PENDING', $6, $7, $8, FALSE, $9)
        ON CONFLICT (environment_id, idempotency_key) DO NOTHING
        RETURNING *
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
    .fetch_optional(pool)
    .await?;

    if let Some(record) = inserted {
        return Ok(record);
    }

    let existing = sqlx::query_as::<_, WaitpointRecord>(
        "SELECT * FROM waitpoints WHERE environment_id = $1 AND idempotency_key = $2",
    )
    .bind(&waitpoint.environment_id)
    .bind(&waitpoint.idempotency_key)
    .fetch_one(pool)
    .await?;
    Ok(existing)
}

/// Get a waitpoint by id.
pub async fn get_waitpoint(pool: &PgPool, waitpoint_id: &str) -> Result<Option<WaitpointRecord>> {
    let record = sqlx::query_as::<_, WaitpointRecord>("SELECT * FROM waitpoints WHERE id = $1")
        .bind(waitpoint_id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Get waitpoints by id, with outputs.
pub async fn get_waitpoints_by_ids(
    pool: &PgPool,
    waitpoint_ids: &[String],
) -> Result<Vec<WaitpointRecord>> {
    if waitpoint_ids.is_empty() {
        return Ok(Vec::new());
    }
    let records = sqlx::query_as::<_, WaitpointRecord>(
        "SELECT * FROM waitpoints WHERE id = ANY($1) ORDER BY id ASC",
    )
    .bind(waitpoint_ids)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Complete a pending waitpoint.
pub async fn complete_waitpoint(
    pool: &PgPool,
    waitpoint_id: &str,
    output: Option<&[u8]>,
    output_is_error: bool,
    completed_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE waitpoints
        SET status = 'COMPLETED',
            output = $1,
            output_is_error = $2,
            completed_at = $3
        WHERE id = $4 AND status = 'PENDING'
        "#,
    )
    .bind(output)
    .bind(output_is_error)
    .bind(completed_at)
    .bind(waitpoint_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Pending DATETIME waitpoints that are due.
pub async fn list_due_datetime_waitpoints(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<WaitpointRecord>> {
    let records = sqlx::query_as::<_, WaitpointRecord>(
        r#"
        SELECT * FROM waitpoints
        WHERE kind = 'DATETIME' AND status = 'PENDING' AND complete_after <= $1
        ORDER BY complete_after ASC
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// The RUN waitpoint completed by a run.
pub async fn get_run_waitpoint(pool: &PgPool, run_id: &str) -> Result<Option<WaitpointRecord>> {
    let record = sqlx::query_as::<_, WaitpointRecord>(
        "SELECT * FROM waitpoints WHERE kind = 'RUN' AND completed_by_run_id = $1 LIMIT 1",
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Waitpoint ids of a run's active blocks.
pub async fn list_active_block_waitpoint_ids(pool: &PgPool, run_id: &str) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        r#"
        SELECT waitpoint_id FROM run_blocks
        WHERE run_id = $1 AND released_at IS NULL
        ORDER BY waitpoint_id
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Active blocks whose waitpoint is still pending.
pub async fn count_pending_blocks(pool: &PgPool, run_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM run_blocks b
        JOIN waitpoints w ON w.id = b.waitpoint_id
        WHERE b.run_id = $1 AND b.released_at IS NULL AND w.status = 'PENDING'
        "#,
    )
    .bind(run_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Runs with an active block on a waitpoint.
pub async fn list_runs_blocked_on(pool: &PgPool, waitpoint_id: &str) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        r#"
        SELECT run_id FROM run_blocks
        WHERE waitpoint_id = $1 AND released_at IS NULL
        ORDER BY created_at ASC
        "#,
    )
    .bind(waitpoint_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

// ============================================================================
// Checkpoints, queues and workers
// ============================================================================

/// Save (or overwrite) a checkpoint.
pub async fn save_checkpoint(
    pool: &PgPool,
    run_id: &str,
    checkpoint_id: &str,
    state: &[u8],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO checkpoints (run_id, checkpoint_id, state, created_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (run_id, checkpoint_id) DO UPDATE
        SET state = EXCLUDED.state, created_at = EXCLUDED.created_at
        "#,
    )
    .bind(run_id)
    .bind(checkpoint_id)
    .bind(state)
    .execute(pool)
    .await?;
    Ok(())
}

/// Load a checkpoint.
pub async fn load_checkpoint(
    pool: &PgPool,
    run_id: &str,
    checkpoint_id: &str,
) -> Result<Option<CheckpointRecord>> {
    let record = sqlx::query_as::<_, CheckpointRecord>(
        "SELECT * FROM checkpoints WHERE run_id = $1 AND checkpoint_id = $2",
    )
    .bind(run_id)
    .bind(checkpoint_id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Insert or update a queue.
pub async fn upsert_queue(pool: &PgPool, queue: &QueueRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO queues
            (environment_id, name, kind, requested_limit, concurrency_limit,
             rate_limit_count, rate_limit_period_ms, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (environment_id, name) DO UPDATE
        SET kind = EXCLUDED.kind,
            requested_limit = EXCLUDED.requested_limit,
            concurrency_limit = EXCLUDED.concurrency_limit,
            rate_limit_count = EXCLUDED.rate_limit_count,
            rate_limit_period_ms = EXCLUDED.rate_limit_period_ms,
            updated_at = EXCLUDED.updated_at
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
    .execute(pool)
    .await?;
    Ok(())
}

/// Get a queue.
pub async fn get_queue(pool: &PgPool, environment_id: &str, name: &str) -> Result<Option<QueueRecord>> {
    let record = sqlx::query_as::<_, QueueRecord>(
        "SELECT * FROM queues WHERE environment_id = $1 AND name = $2",
    )
    .bind(environment_id)
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Upsert a background worker and replace its tasks.
pub async fn upsert_background_worker(
    pool: &PgPool,
    environment_id: &str,
    version: &str,
    tasks: &[(String, String)],
) -> Result<BackgroundWorkerRecord> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO background_workers (id, environment_id, version, created_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (environment_id, version) DO NOTHING
        "#,
    )
    .bind(new_id())
    .bind(environment_id)
    .bind(version)
    .execute(&mut *tx)
    .await?;

    let worker = sqlx::query_as::<_, BackgroundWorkerRecord>(
        "SELECT * FROM background_workers WHERE environment_id = $1 AND version = $2",
    )
    .bind(environment_id)
    .bind(version)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM background_worker_tasks WHERE worker_id = $1")
        .bind(&worker.id)
        .execute(&mut *tx)
        .await?;

    let (task_ids, queues): (Vec<String>, Vec<String>) = tasks.iter().cloned().unzip();
    sqlx::query(
        r#"
        INSERT INTO background_worker_tasks (worker_id, task_identifier, queue_name)
        SELECT $1, t.task_identifier, t.queue_name
        FROM UNNEST($2::text[], $3::text[]) AS t(task_identifier, queue_name)
        "#,
    )
    .bind(&worker.id)
    .bind(&task_ids)
    .bind(&queues)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(worker)
}

/// Record the environment and organization ceilings of an environment.
pub async fn upsert_environment_ceilings(
    pool: &PgPool,
    ceilings: &EnvironmentCeilingsRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO environment_ceilings
            (environment_id, environment_max, organization_max, updated_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (environment_id) DO UPDATE
        SET environment_max = EXCLUDED.environment_max,
            organization_max = EXCLUDED.organization_max,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&ceilings.environment_id)
    .bind(ceilings.environment_max)
    .bind(ceilings.organization_max)
    .bind(ceilings.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Queue of the task on the environment's latest worker that supports it.
pub async fn find_task_queue(
    pool: &PgPool,
    environment_id: &str,
    task_identifier: &str,
) -> Result<Option<String>> {
    let queue_name: Option<String> = sqlx::query_scalar(
        r#"
        SELECT t.queue_name
        FROM background_worker_tasks t
        JOIN background_workers w ON w.id = t.worker_id
        WHERE w.environment_id = $1 AND t.task_identifier = $2
        ORDER BY w.created_at DESC, w.id DESC
        LIMIT 1
        "#,
    )
    .bind(environment_id)
    .bind(task_identifier)
    .fetch_optional(pool)
    .await?;
    Ok(queue_name)
}

// ============================================================================
// Trait implementation
// ============================================================================

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_run(&self, run: &NewRun, snapshot: &NewSnapshot) -> Result<RunRecord> {
        insert_run(&self.pool, run, snapshot).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        get_run(&self.pool, run_id).await
    }

    async fn get_run_by_friendly_id(&self, friendly_id: &str) -> Result<Option<RunRecord>> {
        get_run_by_friendly_id(&self.pool, friendly_id).await
    }

    async fn set_run_queue(&self, run_id: &str, queue_name: &str) -> Result<bool> {
        set_run_queue(&self.pool, run_id, queue_name).await
    }

    async fn write_snapshot(&self, transition: &Transition) -> Result<SnapshotWrite> {
        write_snapshot(&self.pool, transition).await
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>> {
        get_snapshot(&self.pool, snapshot_id).await
    }

    async fn get_latest_snapshot(&self, run_id: &str) -> Result<Option<SnapshotRecord>> {
        get_latest_snapshot(&self.pool, run_id).await
    }

    async fn list_snapshots(&self, run_id: &str) -> Result<Vec<SnapshotRecord>> {
        list_snapshots(&self.pool, run_id).await
    }

    async fn list_snapshots_after(
        &self,
        run_id: &str,
        after_seq: i64,
    ) -> Result<Vec<SnapshotRecord>> {
        list_snapshots_after(&self.pool, run_id, after_seq).await
    }

    async fn list_snapshot_waitpoint_ids(&self, snapshot_id: &str) -> Result<Vec<String>> {
        list_snapshot_waitpoint_ids(&self.pool, snapshot_id).await
    }

    async fn attach_snapshot_waitpoints(
        &self,
        snapshot_id: &str,
        waitpoint_ids: &[String],
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        attach_waitpoint_rows(&mut conn, snapshot_id, waitpoint_ids).await
    }

    async fn list_runs_waiting_for_deploy(
        &self,
        environment_id: &str,
        task_identifiers: &[String],
        limit: i64,
    ) -> Result<Vec<RunRecord>> {
        list_runs_waiting_for_deploy(&self.pool, environment_id, task_identifiers, limit).await
    }

    async fn insert_waitpoint(&self, waitpoint: &NewWaitpoint) -> Result<WaitpointRecord> {
        insert_waitpoint(&self.pool, waitpoint).await
    }

    async fn get_waitpoint(&self, waitpoint_id: &str) -> Result<Option<WaitpointRecord>> {
        get_waitpoint(&self.pool, waitpoint_id).await
    }

    async fn get_waitpoints_by_ids(
        &self,
        waitpoint_ids: &[String],
    ) -> Result<Vec<WaitpointRecord>> {
        get_waitpoints_by_ids(&self.pool, waitpoint_ids).await
    }

    async fn complete_waitpoint(
        &self,
        waitpoint_id: &str,
        output: Option<&[u8]>,
        output_is_error: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        complete_waitpoint(&self.pool, waitpoint_id, output, output_is_error, completed_at).await
    }

    async fn list_due_datetime_waitpoints(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WaitpointRecord>> {
        list_due_datetime_waitpoints(&self.pool, now, limit).await
    }

    async fn get_run_waitpoint(&self, run_id: &str) -> Result<Option<WaitpointRecord>> {
        get_run_waitpoint(&self.pool, run_id).await
    }

    async fn insert_blocks(
        &self,
        run_id: &str,
        waitpoint_ids: &[String],
        blocking_snapshot_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_block_rows(&mut conn, run_id, waitpoint_ids, blocking_snapshot_id, now).await
    }

    async fn list_active_block_waitpoint_ids(&self, run_id: &str) -> Result<Vec<String>> {
        list_active_block_waitpoint_ids(&self.pool, run_id).await
    }

    async fn count_pending_blocks(&self, run_id: &str) -> Result<i64> {
        count_pending_blocks(&self.pool, run_id).await
    }

    async fn list_runs_blocked_on(&self, waitpoint_id: &str) -> Result<Vec<String>> {
        list_runs_blocked_on(&self.pool, waitpoint_id).await
    }

    async fn save_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
        state: &[u8],
    ) -> Result<()> {
        save_checkpoint(&self.pool, run_id, checkpoint_id, state).await
    }

    async fn load_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointRecord>> {
        load_checkpoint(&self.pool, run_id, checkpoint_id).await
    }

    async fn upsert_queue(&self, queue: &QueueRecord) -> Result<()> {
        upsert_queue(&self.pool, queue).await
    }

    async fn get_queue(&self, environment_id: &str, name: &str) -> Result<Option<QueueRecord>> {
        get_queue(&self.pool, environment_id, name).await
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
            SET requested_limit = $1, concurrency_limit = $2, updated_at = NOW()
            WHERE environment_id = $3 AND name = $4
            "#,
        )
        .bind(requested_limit)
        .bind(limit)
        .bind(environment_id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_environment_ceilings(&self, ceilings: &EnvironmentCeilingsRecord) -> Result<()> {
        upsert_environment_ceilings(&self.pool, ceilings).await
    }

    async fn get_environment_ceilings(
        &self,
        environment_id: &str,
    ) -> Result<Option<EnvironmentCeilingsRecord>> {
        let record = sqlx::query_as::<_, EnvironmentCeilingsRecord>(
            "SELECT * FROM environment_ceilings WHERE environment_id = $1",
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
        upsert_background_worker(&self.pool, environment_id, version, tasks).await
    }

    async fn list_worker_tasks(&self, worker_id: &str) -> Result<Vec<WorkerTaskRecord>> {
        let records = sqlx::query_as::<_, WorkerTaskRecord>(
            "SELECT * FROM background_worker_tasks WHERE worker_id = $1 ORDER BY task_identifier",
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
        find_task_queue(&self.pool, environment_id, task_identifier).await
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
                WHERE w.environment_id = $1 AND t.task_identifier = $2
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
            VALUES ($1, $2, $3)
            ON CONFLICT (run_id) DO UPDATE
            SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
            WHERE run_locks.expires_at <= $4
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
        let result = sqlx::query("DELETE FROM run_locks WHERE run_id = $1 AND owner = $2")
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
