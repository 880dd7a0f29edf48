// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The run engine.
//!
//! [`Engine`] is the only writer of run status. Every transition runs under the
//! run lock and is written as a compare-and-swap on the run's current snapshot:
//! the caller presents the snapshot id it last saw, and a writer that lost the
//! race gets its snapshot recorded as superseded plus a
//! [`EngineError::SnapshotStale`] error.
//!
//! Waitpoint, snapshot, queue and deploy operations live in their own modules
//! as further `impl Engine` blocks.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::dispatch::{
    DequeueRequest, DispatchMessage, DispatchQueue, EnqueueRequest, MAX_DEQUEUE_BATCH,
};
use crate::error::{EngineError, Result};
use crate::lock::RunLocker;
use crate::persistence::{
    CheckpointRecord, NewRun, NewSnapshot, NewWaitpoint, Persistence, RunRecord, SnapshotRecord,
    SnapshotWrite, Transition,
};
use crate::state_machine;
use crate::types::{ExecutionStatus, WaitpointKind, friendly_id, new_id, task_queue_name};

/// Messages leased per dequeue when the caller gives no batch hint.
pub const DEFAULT_DEQUEUE_BATCH: usize = 10;

/// Expired leases handled per reclaim pass.
pub const DEFAULT_RECLAIM_BATCH: i64 = 100;

/// Run engine over a persistence backend and a dispatch queue.
#[derive(Clone)]
pub struct Engine {
    pub(crate) persistence: Arc<dyn Persistence>,
    pub(crate) dispatch: Arc<dyn DispatchQueue>,
    pub(crate) locker: RunLocker,
    pub(crate) config: EngineConfig,
}

/// Parent link of a triggered run.
#[derive(Debug, Clone)]
pub struct ParentRun {
    pub run_id: String,
    /// Block the parent until the child reaches a terminal status.
    pub block: bool,
}

/// Input of [`Engine::trigger_run`].
#[derive(Debug, Clone, Default)]
pub struct TriggerRunRequest {
    pub environment_id: String,
    pub project_id: String,
    pub task_identifier: String,
    pub payload: Vec<u8>,
    /// Admission queue; defaults to the task's virtual queue.
    pub queue_name: Option<String>,
    /// Worker queue; defaults to the environment id.
    pub worker_queue: Option<String>,
    pub concurrency_key: Option<String>,
    pub parent: Option<ParentRun>,
}

/// A run handed to a consumer by [`Engine::dequeue_from_worker_queue`].
#[derive(Debug, Clone)]
pub struct DequeuedRun {
    pub run: RunRecord,
    /// Snapshot to present to [`Engine::start_run_attempt`].
    pub snapshot_id: String,
    pub message: DispatchMessage,
}

/// What a worker needs to run an attempt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub run: RunRecord,
    pub snapshot: SnapshotRecord,
    pub attempt_number: i32,
    /// Checkpoint to resume from, if the run was suspended before.
    pub checkpoint: Option<CheckpointRecord>,
}

/// Result of an attempt reported by the worker.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Success { output: Vec<u8> },
    Failure { error: String },
}

/// Extra effects of a transition besides the status change.
#[derive(Debug, Clone, Default)]
pub(crate) struct TransitionEffects {
    pub waitpoint_ids: Vec<String>,
    pub block_waitpoint_ids: Vec<String>,
    pub release_blocks: bool,
    pub output: Option<Vec<u8>>,
    pub error: Option<String>,
    /// Replaces the checkpoint carried over from the current snapshot.
    pub checkpoint_id: Option<String>,
    pub attempt_number: Option<i32>,
}

impl Engine {
    /// Create a new engine.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        dispatch: Arc<dyn DispatchQueue>,
        config: EngineConfig,
    ) -> Self {
        let locker = RunLocker::new(persistence.clone(), &config);
        Self {
            persistence,
            dispatch,
            locker,
            config,
        }
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn dispatch(&self) -> &Arc<dyn DispatchQueue> {
        &self.dispatch
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        self.persistence
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    pub(crate) fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::from_std(self.config.lease_ttl)
            .unwrap_or_else(|_| ChronoDuration::seconds(0))
    }

    /// Refuse a transition early, before any side effect.
    ///
    /// Only checked when the presented snapshot is current; a stale caller is
    /// answered by the superseded write in [`Engine::apply_transition`].
    pub(crate) fn check_transition(
        &self,
        run: &RunRecord,
        presented_snapshot_id: &str,
        to: ExecutionStatus,
    ) -> Result<()> {
        let from = run.status()?;
        if from.is_terminal() || presented_snapshot_id == run.current_snapshot_id {
            state_machine::ensure_transition(&run.id, from, to)?;
        }
        Ok(())
    }

    /// Write a transition. Must be called with the run lock held.
    pub(crate) async fn apply_transition(
        &self,
        run: &RunRecord,
        presented_snapshot_id: &str,
        to: ExecutionStatus,
        description: impl Into<String>,
        effects: TransitionEffects,
    ) -> Result<SnapshotRecord> {
        self.check_transition(run, presented_snapshot_id, to)?;

        let carried_checkpoint = match effects.checkpoint_id {
            Some(id) => Some(id),
            None => self
                .persistence
                .get_snapshot(&run.current_snapshot_id)
                .await?
                .and_then(|s| s.checkpoint_id),
        };

        let transition = Transition {
            expected_snapshot_id: presented_snapshot_id.to_string(),
            snapshot: NewSnapshot {
                id: new_id(),
                run_id: run.id.clone(),
                status: to,
                description: description.into(),
                checkpoint_id: carried_checkpoint,
                attempt_number: effects.attempt_number.unwrap_or(run.attempt_number),
                waitpoint_ids: effects.waitpoint_ids,
                created_at: Utc::now(),
            },
            output: effects.output,
            error: effects.error,
            completed: to.is_terminal(),
            block_waitpoint_ids: effects.block_waitpoint_ids,
            release_blocks: effects.release_blocks,
        };

        match self.persistence.write_snapshot(&transition).await? {
            SnapshotWrite::Applied(snapshot) => {
                debug!(
                    run_id = %run.id,
                    from = %run.status,
                    to = %to,
                    snapshot_id = %snapshot.id,
                    "run transitioned"
                );
                Ok(snapshot)
            }
            SnapshotWrite::Superseded {
                current_snapshot_id,
            } => {
                warn!(
                    run_id = %run.id,
                    presented = %presented_snapshot_id,
                    current = %current_snapshot_id,
                    "stale snapshot presented, write superseded"
                );
                Err(EngineError::SnapshotStale {
                    run_id: run.id.clone(),
                    presented: presented_snapshot_id.to_string(),
                    current: current_snapshot_id,
                })
            }
        }
    }

    pub(crate) async fn enqueue_run(&self, run: &RunRecord) -> Result<()> {
        self.dispatch
            .enqueue(&EnqueueRequest {
                run_id: run.id.clone(),
                environment_id: run.environment_id.clone(),
                queue_name: run.queue_name.clone(),
                worker_queue: run.worker_queue.clone(),
                concurrency_key: run.concurrency_key.clone(),
                payload: run.payload.clone(),
                available_at: Utc::now(),
            })
            .await
    }

    // ========================================================================
    // Trigger
    // ========================================================================

    /// Create a run and hand it to the dispatch queue, or park it until a
    /// worker supporting its task is deployed.
    #[instrument(skip(self, request), fields(environment_id = %request.environment_id, task = %request.task_identifier))]
    pub async fn trigger_run(&self, request: TriggerRunRequest) -> Result<RunRecord> {
        if request.environment_id.is_empty() {
            return Err(EngineError::validation("environment_id", "is required"));
        }
        if request.project_id.is_empty() {
            return Err(EngineError::validation("project_id", "is required"));
        }
        if request.task_identifier.is_empty() {
            return Err(EngineError::validation("task_identifier", "is required"));
        }
        if let Some(parent) = &request.parent {
            self.get_run(&parent.run_id).await?;
        }

        // Without an explicit queue the run goes to the queue its task was registered on.
        let queue_name = match &request.queue_name {
            Some(queue_name) => queue_name.clone(),
            None => self
                .persistence
                .find_task_queue(&request.environment_id, &request.task_identifier)
                .await?
                .unwrap_or_else(|| task_queue_name(&request.task_identifier)),
        };

        let now = Utc::now();
        let run_id = new_id();
        let new_run = NewRun {
            id: run_id.clone(),
            friendly_id: friendly_id("run"),
            environment_id: request.environment_id.clone(),
            project_id: request.project_id.clone(),
            task_identifier: request.task_identifier.clone(),
            queue_name,
            worker_queue: request
                .worker_queue
                .clone()
                .unwrap_or_else(|| request.environment_id.clone()),
            concurrency_key: request.concurrency_key.clone(),
            payload: request.payload,
            parent_run_id: request.parent.as_ref().map(|p| p.run_id.clone()),
            created_at: now,
        };
        let first_snapshot = NewSnapshot {
            id: new_id(),
            run_id: run_id.clone(),
            status: ExecutionStatus::RunCreated,
            description: "Run was created".to_string(),
            checkpoint_id: None,
            attempt_number: 0,
            waitpoint_ids: Vec::new(),
            created_at: now,
        };
        let run = self.persistence.insert_run(&new_run, &first_snapshot).await?;

        // The completion waitpoint must exist before the child can finish.
        if let Some(parent) = &request.parent {
            let waitpoint = self
                .persistence
                .insert_waitpoint(&NewWaitpoint {
                    id: new_id(),
                    friendly_id: friendly_id("waitpoint"),
                    environment_id: run.environment_id.clone(),
                    project_id: run.project_id.clone(),
                    kind: WaitpointKind::Run,
                    idempotency_key: None,
                    complete_after: None,
                    completed_by_run_id: Some(run.id.clone()),
                    created_at: now,
                })
                .await?;

            if parent.block
                && let Err(e) = self
                    .block_run_with_waitpoint(&parent.run_id, std::slice::from_ref(&waitpoint.id))
                    .await
            {
                warn!(run_id = %run.id, parent_run_id = %parent.run_id, error = %e, "parent could not be blocked, canceling child");
                self.cancel_run(&run.id, "parent run could not be blocked")
                    .await?;
                return Err(e);
            }
        }

        let supported = self
            .persistence
            .environment_supports_task(&run.environment_id, &run.task_identifier)
            .await?;

        let guard = self.locker.acquire(&run.id).await?;
        let result = self.admit_new_run(&run, supported).await;
        guard.release().await;
        result?;

        let run = self.get_run(&run_id).await?;
        info!(run_id = %run.id, friendly_id = %run.friendly_id, status = %run.status, "Run triggered");
        Ok(run)
    }

    async fn admit_new_run(&self, run: &RunRecord, supported: bool) -> Result<()> {
        if supported {
            self.apply_transition(
                run,
                &run.current_snapshot_id,
                ExecutionStatus::Queued,
                "Run was queued",
                TransitionEffects::default(),
            )
            .await?;
            self.enqueue_run(run).await
        } else {
            self.apply_transition(
                run,
                &run.current_snapshot_id,
                ExecutionStatus::WaitingForDeploy,
                "No deployed worker supports the task",
                TransitionEffects::default(),
            )
            .await
            .map(|_| ())
        }
    }

    // ========================================================================
    // Dequeue and attempts
    // ========================================================================

    /// Lease runs from a worker queue and move each to PENDING_EXECUTING.
    ///
    /// The batch hint is clamped to `1..=MAX_DEQUEUE_BATCH`. Returns an empty vec
    /// when no slot is free.
    #[instrument(skip(self))]
    pub async fn dequeue_from_worker_queue(
        &self,
        consumer_id: &str,
        worker_queue: &str,
        max_messages: Option<usize>,
    ) -> Result<Vec<DequeuedRun>> {
        let now = Utc::now();
        let messages = self
            .dispatch
            .dequeue(&DequeueRequest {
                consumer_id: consumer_id.to_string(),
                worker_queue: worker_queue.to_string(),
                max_messages: max_messages
                    .unwrap_or(DEFAULT_DEQUEUE_BATCH)
                    .clamp(1, MAX_DEQUEUE_BATCH),
                lease_ttl: self.config.lease_ttl,
                strategy: self.config.dequeue_strategy,
                now,
            })
            .await?;

        let mut dequeued = Vec::with_capacity(messages.len());
        for message in messages {
            let run_id = message.run_id.clone();
            let guard = match self.locker.acquire(&run_id).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "could not lock dequeued run, releasing message");
                    self.release_message(&run_id).await;
                    continue;
                }
            };
            let result = self.start_pending_locked(message).await;
            guard.release().await;

            match result {
                Ok(Some(run)) => dequeued.push(run),
                Ok(None) => {}
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "failed to dequeue run, releasing message");
                    self.release_message(&run_id).await;
                }
            }
        }

        Ok(dequeued)
    }

    async fn release_message(&self, run_id: &str) {
        if let Err(e) = self.dispatch.release(run_id, Utc::now()).await {
            warn!(run_id = %run_id, error = %e, "failed to release message, left for the reclaimer");
        }
    }

    async fn start_pending_locked(&self, message: DispatchMessage) -> Result<Option<DequeuedRun>> {
        let Some(run) = self.persistence.get_run(&message.run_id).await? else {
            warn!(run_id = %message.run_id, "dequeued message for unknown run, dropping");
            self.dispatch.acknowledge(&message.run_id).await?;
            return Ok(None);
        };

        if run.status()? != ExecutionStatus::Queued {
            debug!(run_id = %run.id, status = %run.status, "dequeued run is no longer queued, dropping message");
            self.dispatch.acknowledge(&run.id).await?;
            return Ok(None);
        }

        let snapshot = self
            .apply_transition(
                &run,
                &run.current_snapshot_id,
                ExecutionStatus::PendingExecuting,
                "Run was dequeued",
                TransitionEffects::default(),
            )
            .await?;
        let run = self.get_run(&run.id).await?;

        Ok(Some(DequeuedRun {
            run,
            snapshot_id: snapshot.id,
            message,
        }))
    }

    /// Start (or resume) an attempt of a dequeued run.
    #[instrument(skip(self))]
    pub async fn start_run_attempt(&self, run_id: &str, snapshot_id: &str) -> Result<AttemptContext> {
        let guard = self.locker.acquire(run_id).await?;
        let result = self.start_run_attempt_locked(run_id, snapshot_id).await;
        guard.release().await;
        result
    }

    async fn start_run_attempt_locked(
        &self,
        run_id: &str,
        snapshot_id: &str,
    ) -> Result<AttemptContext> {
        let run = self.get_run(run_id).await?;
        let resume_from = self
            .persistence
            .get_snapshot(&run.current_snapshot_id)
            .await?
            .and_then(|s| s.checkpoint_id);

        let (attempt_number, description) = match &resume_from {
            Some(_) => (run.attempt_number, "Attempt resumed from checkpoint"),
            None => (run.attempt_number + 1, "Attempt started"),
        };

        let snapshot = self
            .apply_transition(
                &run,
                snapshot_id,
                ExecutionStatus::Executing,
                description,
                TransitionEffects {
                    attempt_number: Some(attempt_number),
                    ..Default::default()
                },
            )
            .await?;

        let checkpoint = match &resume_from {
            Some(checkpoint_id) => {
                let checkpoint = self
                    .persistence
                    .load_checkpoint(run_id, checkpoint_id)
                    .await?;
                if checkpoint.is_none() {
                    warn!(run_id = %run_id, checkpoint_id = %checkpoint_id, "checkpoint referenced by snapshot is missing");
                }
                checkpoint
            }
            None => None,
        };

        self.dispatch
            .extend_lease(run_id, self.lease_expiry(Utc::now()))
            .await?;

        info!(run_id = %run_id, attempt_number, resumed = checkpoint.is_some(), "Run attempt started");
        Ok(AttemptContext {
            run: self.get_run(run_id).await?,
            snapshot,
            attempt_number,
            checkpoint,
        })
    }

    /// Extend the dispatch lease of an executing run.
    ///
    /// Heartbeats do not change status, so a stale snapshot is reported without
    /// writing a snapshot row.
    #[instrument(skip(self))]
    pub async fn heartbeat_run(&self, run_id: &str, snapshot_id: &str) -> Result<DateTime<Utc>> {
        let guard = self.locker.acquire(run_id).await?;
        let result = self.heartbeat_run_locked(run_id, snapshot_id).await;
        guard.release().await;
        result
    }

    async fn heartbeat_run_locked(&self, run_id: &str, snapshot_id: &str) -> Result<DateTime<Utc>> {
        let run = self.get_run(run_id).await?;
        let status = run.status()?;
        if status.is_terminal() {
            return Err(EngineError::RunTerminal {
                run_id: run.id,
                status: run.status,
            });
        }
        if run.current_snapshot_id != snapshot_id {
            return Err(EngineError::SnapshotStale {
                run_id: run.id,
                presented: snapshot_id.to_string(),
                current: run.current_snapshot_id,
            });
        }
        if !status.holds_lease() {
            return Err(EngineError::validation(
                "run_id",
                format!("run is {status} and holds no lease"),
            ));
        }

        let expires_at = self.lease_expiry(Utc::now());
        if !self.dispatch.extend_lease(run_id, expires_at).await? {
            warn!(run_id = %run_id, "heartbeat for run without a leased message");
        }
        Ok(expires_at)
    }

    /// Checkpoint a blocked run and give its slot back.
    #[instrument(skip(self, checkpoint_state), fields(state_size = checkpoint_state.len()))]
    pub async fn suspend_run(
        &self,
        run_id: &str,
        snapshot_id: &str,
        checkpoint_state: Vec<u8>,
    ) -> Result<SnapshotRecord> {
        let guard = self.locker.acquire(run_id).await?;
        let result = self
            .suspend_run_locked(run_id, snapshot_id, &checkpoint_state)
            .await;
        guard.release().await;
        result
    }

    async fn suspend_run_locked(
        &self,
        run_id: &str,
        snapshot_id: &str,
        checkpoint_state: &[u8],
    ) -> Result<SnapshotRecord> {
        let run = self.get_run(run_id).await?;
        self.check_transition(&run, snapshot_id, ExecutionStatus::Suspended)?;

        let checkpoint_id = new_id();
        if snapshot_id == run.current_snapshot_id {
            self.persistence
                .save_checkpoint(run_id, &checkpoint_id, checkpoint_state)
                .await?;
        }

        let snapshot = self
            .apply_transition(
                &run,
                snapshot_id,
                ExecutionStatus::Suspended,
                "Run suspended with checkpoint",
                TransitionEffects {
                    checkpoint_id: Some(checkpoint_id),
                    ..Default::default()
                },
            )
            .await?;
        self.dispatch.acknowledge(run_id).await?;
        info!(run_id = %run_id, checkpoint_id = ?snapshot.checkpoint_id, "Run suspended");

        // Every waitpoint may have completed between blocking and suspending.
        let run = self.get_run(run_id).await?;
        match self.unblock_locked(&run).await? {
            Some(unblocked) => Ok(unblocked),
            None => Ok(snapshot),
        }
    }

    /// Record the outcome of an attempt. Completes the run's RUN waitpoint.
    #[instrument(skip(self, outcome))]
    pub async fn complete_run_attempt(
        &self,
        run_id: &str,
        snapshot_id: &str,
        outcome: AttemptOutcome,
    ) -> Result<RunRecord> {
        let guard = self.locker.acquire(run_id).await?;
        let result = self
            .complete_run_attempt_locked(run_id, snapshot_id, outcome)
            .await;
        guard.release().await;
        let (status, output, is_error) = result?;

        info!(run_id = %run_id, status = %status, "Run attempt completed");
        self.complete_run_waitpoint(run_id, output, is_error).await?;
        self.get_run(run_id).await
    }

    async fn complete_run_attempt_locked(
        &self,
        run_id: &str,
        snapshot_id: &str,
        outcome: AttemptOutcome,
    ) -> Result<(ExecutionStatus, Vec<u8>, bool)> {
        let run = self.get_run(run_id).await?;
        let (to, description, effects, output, is_error) = match outcome {
            AttemptOutcome::Success { output } => (
                ExecutionStatus::Finished,
                "Run finished",
                TransitionEffects {
                    output: Some(output.clone()),
                    release_blocks: true,
                    ..Default::default()
                },
                output,
                false,
            ),
            AttemptOutcome::Failure { error } => (
                ExecutionStatus::Failed,
                "Run failed",
                TransitionEffects {
                    error: Some(error.clone()),
                    release_blocks: true,
                    ..Default::default()
                },
                error.into_bytes(),
                true,
            ),
        };

        self.apply_transition(&run, snapshot_id, to, description, effects)
            .await?;
        self.dispatch.acknowledge(run_id).await?;
        Ok((to, output, is_error))
    }

    /// Cancel a run that has not reached a terminal status.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: &str, reason: &str) -> Result<RunRecord> {
        let guard = self.locker.acquire(run_id).await?;
        let result = self.cancel_run_locked(run_id, reason).await;
        guard.release().await;
        result?;

        info!(run_id = %run_id, reason = %reason, "Run canceled");
        self.complete_run_waitpoint(run_id, reason.as_bytes().to_vec(), true)
            .await?;
        self.get_run(run_id).await
    }

    async fn cancel_run_locked(&self, run_id: &str, reason: &str) -> Result<()> {
        let run = self.get_run(run_id).await?;
        self.apply_transition(
            &run,
            &run.current_snapshot_id,
            ExecutionStatus::Canceled,
            format!("Run canceled: {reason}"),
            TransitionEffects {
                error: Some(reason.to_string()),
                release_blocks: true,
                ..Default::default()
            },
        )
        .await?;
        self.dispatch.remove(run_id).await?;
        Ok(())
    }

    async fn complete_run_waitpoint(
        &self,
        run_id: &str,
        output: Vec<u8>,
        is_error: bool,
    ) -> Result<()> {
        if let Some(waitpoint) = self.persistence.get_run_waitpoint(run_id).await? {
            self.complete_waitpoint(&waitpoint.id, Some(output), is_error)
                .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Lease reclaim
    // ========================================================================

    /// Return expired leases to the queue and re-queue their runs.
    ///
    /// Returns how many messages were reclaimed.
    #[instrument(skip(self))]
    pub async fn reclaim_expired_leases(&self, limit: i64) -> Result<usize> {
        let expired = self
            .dispatch
            .list_expired_leases(Utc::now(), limit)
            .await?;

        let mut reclaimed = 0;
        for message in expired {
            let guard = match self.locker.acquire(&message.run_id).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(run_id = %message.run_id, error = %e, "could not lock run with expired lease");
                    continue;
                }
            };
            let result = self.reclaim_locked(&message.run_id).await;
            guard.release().await;

            match result {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(e) => warn!(run_id = %message.run_id, error = %e, "failed to reclaim lease"),
            }
        }

        if reclaimed > 0 {
            info!(reclaimed, "Reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    async fn reclaim_locked(&self, run_id: &str) -> Result<bool> {
        let now = Utc::now();
        // A heartbeat may have landed since the listing.
        let Some(message) = self.dispatch.get_message(run_id).await? else {
            return Ok(false);
        };
        if !message.is_leased() || message.lease_expires_at.is_some_and(|at| at > now) {
            return Ok(false);
        }

        let Some(run) = self.persistence.get_run(run_id).await? else {
            self.dispatch.remove(run_id).await?;
            return Ok(true);
        };

        let status = run.status()?;
        if status.holds_lease() {
            self.apply_transition(
                &run,
                &run.current_snapshot_id,
                ExecutionStatus::Queued,
                "Lease expired, run re-queued",
                TransitionEffects {
                    release_blocks: true,
                    ..Default::default()
                },
            )
            .await?;
            self.dispatch.release(run_id, now).await?;
        } else if status == ExecutionStatus::Queued {
            self.dispatch.release(run_id, now).await?;
        } else {
            self.dispatch.remove(run_id).await?;
        }
        debug!(run_id = %run_id, status = %status, delivery_count = message.delivery_count, "lease reclaimed");
        Ok(true)
    }
}
