// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for the run engine.
//!
//! The [`Persistence`] trait owns runs, execution snapshots, waitpoints, blocks,
//! checkpoints, queues, background workers and run locks. The dispatch queue has
//! its own store in [`crate::dispatch`].

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{ExecutionStatus, SnapshotValidity, WaitpointKind, WaitpointStatus};

/// Run record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    /// Internal identifier.
    pub id: String,
    /// Externally exposed identifier (`run_<hex>`).
    pub friendly_id: String,
    /// Owning environment.
    pub environment_id: String,
    /// Owning project.
    pub project_id: String,
    /// Task this run executes.
    pub task_identifier: String,
    /// Admission queue.
    pub queue_name: String,
    /// Worker queue consumers dequeue from.
    pub worker_queue: String,
    /// Optional user-supplied concurrency key.
    pub concurrency_key: Option<String>,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Current status (mirrors the current snapshot).
    pub status: String,
    /// Identifier of the single valid snapshot.
    pub current_snapshot_id: String,
    /// Attempt counter.
    pub attempt_number: i32,
    /// Run that triggered this one, if any.
    pub parent_run_id: Option<String>,
    /// Output of a finished run.
    pub output: Option<Vec<u8>>,
    /// Error of a failed or canceled run.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Typed view of the status column.
    pub fn status(&self) -> Result<ExecutionStatus> {
        self.status.parse()
    }
}

/// Execution snapshot record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SnapshotRecord {
    /// Per-store monotonically increasing sequence; orders snapshots of a run.
    pub seq: i64,
    pub id: String,
    pub run_id: String,
    /// Status the run held when this snapshot was written.
    pub status: String,
    /// Human readable reason for the transition.
    pub description: String,
    /// `valid`, `historical` or `superseded`.
    pub validity: String,
    /// Checkpoint to resume from, if any.
    pub checkpoint_id: Option<String>,
    pub attempt_number: i32,
    pub created_at: DateTime<Utc>,
}

impl SnapshotRecord {
    /// Typed view of the status column.
    pub fn status(&self) -> Result<ExecutionStatus> {
        self.status.parse()
    }

    /// Typed view of the validity column.
    pub fn validity(&self) -> Result<SnapshotValidity> {
        self.validity.parse()
    }
}

/// Waitpoint record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WaitpointRecord {
    pub id: String,
    /// Externally exposed identifier (`waitpoint_<hex>`).
    pub friendly_id: String,
    pub environment_id: String,
    pub project_id: String,
    /// `MANUAL`, `DATETIME` or `RUN`.
    pub kind: String,
    /// `PENDING` or `COMPLETED`.
    pub status: String,
    /// Unique per environment when set.
    pub idempotency_key: Option<String>,
    /// DATETIME waitpoints complete once this passes.
    pub complete_after: Option<DateTime<Utc>>,
    /// RUN waitpoints complete when this run reaches a terminal status.
    pub completed_by_run_id: Option<String>,
    pub output: Option<Vec<u8>>,
    pub output_is_error: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WaitpointRecord {
    /// Whether the waitpoint has been completed.
    pub fn is_completed(&self) -> bool {
        self.status == WaitpointStatus::Completed.as_str()
    }

    /// Typed view of the kind column.
    pub fn kind(&self) -> Result<WaitpointKind> {
        self.kind.parse()
    }
}

/// Checkpoint record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckpointRecord {
    /// Database primary key.
    pub id: i64,
    pub run_id: String,
    pub checkpoint_id: String,
    /// Opaque execution state.
    pub state: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Queue record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueRecord {
    pub environment_id: String,
    pub name: String,
    /// `NAMED` or `VIRTUAL`.
    pub kind: String,
    /// Limit asked for at registration.
    pub requested_limit: Option<i64>,
    /// Limit after clamping; `None` is unlimited.
    pub concurrency_limit: Option<i64>,
    pub rate_limit_count: Option<i64>,
    pub rate_limit_period_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Background worker record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BackgroundWorkerRecord {
    pub id: String,
    pub environment_id: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

/// Concurrency ceilings of an environment, recorded at worker registration.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct EnvironmentCeilingsRecord {
    pub environment_id: String,
    pub environment_max: Option<i64>,
    pub organization_max: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// Task supported by a background worker.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct WorkerTaskRecord {
    pub worker_id: String,
    pub task_identifier: String,
    pub queue_name: String,
}

/// New run, inserted together with its first snapshot.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: String,
    pub friendly_id: String,
    pub environment_id: String,
    pub project_id: String,
    pub task_identifier: String,
    pub queue_name: String,
    pub worker_queue: String,
    pub concurrency_key: Option<String>,
    pub payload: Vec<u8>,
    pub parent_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// New snapshot row.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub id: String,
    pub run_id: String,
    pub status: ExecutionStatus,
    pub description: String,
    pub checkpoint_id: Option<String>,
    pub attempt_number: i32,
    /// Waitpoints attached to this snapshot.
    pub waitpoint_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A state transition written atomically by [`Persistence::write_snapshot`].
#[derive(Debug, Clone)]
pub struct Transition {
    /// Snapshot the writer believes is current.
    pub expected_snapshot_id: String,
    /// Snapshot to write.
    pub snapshot: NewSnapshot,
    /// Output to store on the run.
    pub output: Option<Vec<u8>>,
    /// Error to store on the run.
    pub error: Option<String>,
    /// Sets `completed_at` on the run.
    pub completed: bool,
    /// Waitpoints to block the run on, owned by the new snapshot.
    pub block_waitpoint_ids: Vec<String>,
    /// Releases every active block of the run.
    pub release_blocks: bool,
}

/// Outcome of a compare-and-swap snapshot write.
#[derive(Debug, Clone)]
pub enum SnapshotWrite {
    /// The snapshot is now the run's valid snapshot.
    Applied(SnapshotRecord),
    /// Another writer moved the run first; the snapshot was stored as superseded.
    Superseded {
        /// The run's actual current snapshot.
        current_snapshot_id: String,
    },
}

/// New waitpoint row.
#[derive(Debug, Clone)]
pub struct NewWaitpoint {
    pub id: String,
    pub friendly_id: String,
    pub environment_id: String,
    pub project_id: String,
    pub kind: WaitpointKind,
    pub idempotency_key: Option<String>,
    pub complete_after: Option<DateTime<Utc>>,
    pub completed_by_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persistence abstraction for the run engine.
///
/// Implementations only store and load; every legality check lives in the engine.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ---- runs and snapshots ----

    /// Insert a run and its first (valid) snapshot in one transaction.
    async fn insert_run(&self, run: &NewRun, snapshot: &NewSnapshot) -> Result<RunRecord>;

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    async fn get_run_by_friendly_id(&self, friendly_id: &str) -> Result<Option<RunRecord>>;

    /// Point a run at another queue. Returns false if the run is unknown.
    async fn set_run_queue(&self, run_id: &str, queue_name: &str) -> Result<bool>;

    /// Compare-and-swap the run's current snapshot.
    ///
    /// On success the previous valid snapshot becomes historical, the new one is
    /// inserted as valid and the run row mirrors its status. Otherwise the new
    /// snapshot is inserted as superseded and nothing else changes.
    async fn write_snapshot(&self, transition: &Transition) -> Result<SnapshotWrite>;

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>>;

    /// The run's valid snapshot.
    async fn get_latest_snapshot(&self, run_id: &str) -> Result<Option<SnapshotRecord>>;

    /// Every snapshot of the run, superseded ones included, by sequence.
    async fn list_snapshots(&self, run_id: &str) -> Result<Vec<SnapshotRecord>>;

    /// Non-superseded snapshots with a sequence greater than `after_seq`.
    async fn list_snapshots_after(&self, run_id: &str, after_seq: i64)
    -> Result<Vec<SnapshotRecord>>;

    /// Waitpoint ids attached to a snapshot, ordered by id.
    async fn list_snapshot_waitpoint_ids(&self, snapshot_id: &str) -> Result<Vec<String>>;

    /// Attach waitpoints to an existing snapshot. Already attached ids are ignored.
    async fn attach_snapshot_waitpoints(
        &self,
        snapshot_id: &str,
        waitpoint_ids: &[String],
    ) -> Result<()>;

    /// Oldest-first runs parked in WAITING_FOR_DEPLOY for one of the given tasks.
    async fn list_runs_waiting_for_deploy(
        &self,
        environment_id: &str,
        task_identifiers: &[String],
        limit: i64,
    ) -> Result<Vec<RunRecord>>;

    // ---- waitpoints ----

    /// Insert a waitpoint. When the idempotency key already exists in the
    /// environment the stored waitpoint is returned instead.
    async fn insert_waitpoint(&self, waitpoint: &NewWaitpoint) -> Result<WaitpointRecord>;

    async fn get_waitpoint(&self, waitpoint_id: &str) -> Result<Option<WaitpointRecord>>;

    /// Fetch the given waitpoints with outputs. Unknown ids are skipped.
    async fn get_waitpoints_by_ids(&self, waitpoint_ids: &[String])
    -> Result<Vec<WaitpointRecord>>;

    /// Complete a pending waitpoint. Returns false when it was already completed.
    async fn complete_waitpoint(
        &self,
        waitpoint_id: &str,
        output: Option<&[u8]>,
        output_is_error: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Pending DATETIME waitpoints whose `complete_after` has passed.
    async fn list_due_datetime_waitpoints(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WaitpointRecord>>;

    /// The RUN waitpoint completed by the given run, if one exists.
    async fn get_run_waitpoint(&self, run_id: &str) -> Result<Option<WaitpointRecord>>;

    // ---- blocks ----

    /// Add active blocks. An active block for the same pair is left untouched;
    /// a released one is reactivated.
    async fn insert_blocks(
        &self,
        run_id: &str,
        waitpoint_ids: &[String],
        blocking_snapshot_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Waitpoint ids of the run's active blocks, ordered by id.
    async fn list_active_block_waitpoint_ids(&self, run_id: &str) -> Result<Vec<String>>;

    /// Number of active blocks whose waitpoint is still pending.
    async fn count_pending_blocks(&self, run_id: &str) -> Result<i64>;

    /// Runs with an active block on the waitpoint.
    async fn list_runs_blocked_on(&self, waitpoint_id: &str) -> Result<Vec<String>>;

    // ---- checkpoints ----

    async fn save_checkpoint(&self, run_id: &str, checkpoint_id: &str, state: &[u8])
    -> Result<()>;

    async fn load_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointRecord>>;

    // ---- queues and workers ----

    async fn upsert_queue(&self, queue: &QueueRecord) -> Result<()>;

    async fn get_queue(&self, environment_id: &str, name: &str) -> Result<Option<QueueRecord>>;

    /// Overwrite the requested and effective limits of an existing queue.
    /// Returns false if unknown.
    async fn set_queue_concurrency_limit(
        &self,
        environment_id: &str,
        name: &str,
        requested_limit: Option<i64>,
        limit: Option<i64>,
    ) -> Result<bool>;

    async fn upsert_environment_ceilings(&self, ceilings: &EnvironmentCeilingsRecord) -> Result<()>;

    async fn get_environment_ceilings(
        &self,
        environment_id: &str,
    ) -> Result<Option<EnvironmentCeilingsRecord>>;

    /// Upsert a worker by (environment, version) and replace its task set.
    async fn upsert_background_worker(
        &self,
        environment_id: &str,
        version: &str,
        tasks: &[(String, String)],
    ) -> Result<BackgroundWorkerRecord>;

    async fn list_worker_tasks(&self, worker_id: &str) -> Result<Vec<WorkerTaskRecord>>;

    /// Queue the task is registered on by the environment's most recently
    /// registered worker that supports it.
    async fn find_task_queue(
        &self,
        environment_id: &str,
        task_identifier: &str,
    ) -> Result<Option<String>>;

    /// Whether any registered worker of the environment supports the task.
    async fn environment_supports_task(
        &self,
        environment_id: &str,
        task_identifier: &str,
    ) -> Result<bool>;

    // ---- run locks ----

    /// Take the lock row for the run if it is free or expired.
    async fn try_acquire_run_lock(
        &self,
        run_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete the lock row if still owned by `owner`.
    async fn release_run_lock(&self, run_id: &str, owner: &str) -> Result<bool>;

    async fn health_check_db(&self) -> Result<bool>;
}
