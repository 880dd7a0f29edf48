// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waitpoint creation, blocking and completion.
//!
//! A run is blocked while any waitpoint referenced by one of its active blocks
//! is pending. Completion is idempotent: the stored output never changes after
//! the first completion, and re-evaluating blocked runs only unblocks a run
//! with zero pending blocks.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::engine::{Engine, TransitionEffects};
use crate::error::{EngineError, Result};
use crate::persistence::{NewWaitpoint, RunRecord, SnapshotRecord, WaitpointRecord};
use crate::types::{ExecutionStatus, WaitpointKind, friendly_id, new_id};

impl Engine {
    /// Create a waitpoint completed only through [`Engine::complete_waitpoint`].
    #[instrument(skip(self))]
    pub async fn create_manual_waitpoint(
        &self,
        environment_id: &str,
        project_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<WaitpointRecord> {
        self.create_waitpoint(
            environment_id,
            project_id,
            WaitpointKind::Manual,
            idempotency_key,
            None,
        )
        .await
    }

    /// Create a waitpoint the sweeper completes once `complete_after` passes.
    #[instrument(skip(self))]
    pub async fn create_date_time_waitpoint(
        &self,
        environment_id: &str,
        project_id: &str,
        complete_after: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<WaitpointRecord> {
        self.create_waitpoint(
            environment_id,
            project_id,
            WaitpointKind::Datetime,
            idempotency_key,
            Some(complete_after),
        )
        .await
    }

    async fn create_waitpoint(
        &self,
        environment_id: &str,
        project_id: &str,
        kind: WaitpointKind,
        idempotency_key: Option<&str>,
        complete_after: Option<DateTime<Utc>>,
    ) -> Result<WaitpointRecord> {
        if environment_id.is_empty() {
            return Err(EngineError::validation("environment_id", "is required"));
        }
        if project_id.is_empty() {
            return Err(EngineError::validation("project_id", "is required"));
        }
        if idempotency_key.is_some_and(str::is_empty) {
            return Err(EngineError::validation(
                "idempotency_key",
                "must not be empty when given",
            ));
        }

        let waitpoint = self
            .persistence
            .insert_waitpoint(&NewWaitpoint {
                id: new_id(),
                friendly_id: friendly_id("waitpoint"),
                environment_id: environment_id.to_string(),
                project_id: project_id.to_string(),
                kind,
                idempotency_key: idempotency_key.map(str::to_string),
                complete_after,
                completed_by_run_id: None,
                created_at: Utc::now(),
            })
            .await?;
        debug!(waitpoint_id = %waitpoint.id, kind = %waitpoint.kind, "waitpoint created");
        Ok(waitpoint)
    }

    /// Block a run on waitpoints.
    ///
    /// Adding a waitpoint the run is already blocked on is a no-op. A run that
    /// is executing moves to EXECUTING_WITH_WAITPOINTS; a run that is already
    /// blocked or suspended gets the waitpoints added to its current snapshot.
    /// Returns the run's current snapshot afterwards, which is the unblock
    /// snapshot when every waitpoint was already completed.
    #[instrument(skip(self, waitpoint_ids), fields(waitpoints = waitpoint_ids.len()))]
    pub async fn block_run_with_waitpoint(
        &self,
        run_id: &str,
        waitpoint_ids: &[String],
    ) -> Result<SnapshotRecord> {
        if waitpoint_ids.is_empty() {
            return Err(EngineError::validation(
                "waitpoint_ids",
                "at least one waitpoint is required",
            ));
        }
        let ids: Vec<String> = waitpoint_ids
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut found = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.config.waitpoint_chunk_size.max(1)) {
            found.extend(self.persistence.get_waitpoints_by_ids(chunk).await?);
        }
        if found.len() != ids.len() {
            let known: BTreeSet<&str> = found.iter().map(|w| w.id.as_str()).collect();
            let missing = ids
                .iter()
                .find(|id| !known.contains(id.as_str()))
                .cloned()
                .unwrap_or_default();
            return Err(EngineError::WaitpointNotFound {
                waitpoint_id: missing,
            });
        }

        let guard = self.locker.acquire(run_id).await?;
        let result = self.block_run_locked(run_id, ids).await;
        guard.release().await;
        result
    }

    async fn block_run_locked(&self, run_id: &str, ids: Vec<String>) -> Result<SnapshotRecord> {
        let run = self.get_run(run_id).await?;
        let status = run.status()?;

        let snapshot = match status {
            s if s.is_terminal() => {
                return Err(EngineError::RunNotBlockable {
                    run_id: run.id,
                    status: run.status,
                });
            }
            ExecutionStatus::Executing => {
                self.apply_transition(
                    &run,
                    &run.current_snapshot_id,
                    ExecutionStatus::ExecutingWithWaitpoints,
                    "Run blocked by waitpoints",
                    TransitionEffects {
                        waitpoint_ids: ids.clone(),
                        block_waitpoint_ids: ids,
                        ..Default::default()
                    },
                )
                .await?
            }
            ExecutionStatus::ExecutingWithWaitpoints | ExecutionStatus::Suspended => {
                self.persistence
                    .attach_snapshot_waitpoints(&run.current_snapshot_id, &ids)
                    .await?;
                self.persistence
                    .insert_blocks(&run.id, &ids, &run.current_snapshot_id, Utc::now())
                    .await?;
                self.current_snapshot(&run).await?
            }
            other => {
                return Err(EngineError::InvalidTransition {
                    run_id: run.id,
                    from: other.to_string(),
                    to: ExecutionStatus::ExecutingWithWaitpoints.to_string(),
                });
            }
        };

        let run = self.get_run(run_id).await?;
        match self.unblock_locked(&run).await? {
            Some(unblocked) => Ok(unblocked),
            None => Ok(snapshot),
        }
    }

    async fn current_snapshot(&self, run: &RunRecord) -> Result<SnapshotRecord> {
        self.persistence
            .get_snapshot(&run.current_snapshot_id)
            .await?
            .ok_or_else(|| EngineError::SnapshotNotFound {
                run_id: run.id.clone(),
                snapshot_id: run.current_snapshot_id.clone(),
            })
    }

    /// Unblock the run if it has active blocks and none of them is pending.
    ///
    /// Must be called with the run lock held.
    pub(crate) async fn unblock_locked(&self, run: &RunRecord) -> Result<Option<SnapshotRecord>> {
        let (to, description) = match run.status()? {
            ExecutionStatus::ExecutingWithWaitpoints => {
                (ExecutionStatus::Executing, "Waitpoints completed")
            }
            ExecutionStatus::Suspended => (
                ExecutionStatus::Queued,
                "Waitpoints completed, run re-queued",
            ),
            _ => return Ok(None),
        };

        let active = self
            .persistence
            .list_active_block_waitpoint_ids(&run.id)
            .await?;
        if active.is_empty() || self.persistence.count_pending_blocks(&run.id).await? > 0 {
            return Ok(None);
        }

        let snapshot = self
            .apply_transition(
                run,
                &run.current_snapshot_id,
                to,
                description,
                TransitionEffects {
                    waitpoint_ids: active,
                    release_blocks: true,
                    ..Default::default()
                },
            )
            .await?;
        if to == ExecutionStatus::Queued {
            self.enqueue_run(run).await?;
        }

        info!(run_id = %run.id, status = %to, "Run unblocked");
        Ok(Some(snapshot))
    }

    /// Complete a waitpoint and resume the runs it was the last block of.
    ///
    /// Completing an already completed waitpoint keeps the stored output.
    #[instrument(skip(self, output))]
    pub async fn complete_waitpoint(
        &self,
        waitpoint_id: &str,
        output: Option<Vec<u8>>,
        is_error: bool,
    ) -> Result<WaitpointRecord> {
        let waitpoint = self
            .persistence
            .get_waitpoint(waitpoint_id)
            .await?
            .ok_or_else(|| EngineError::WaitpointNotFound {
                waitpoint_id: waitpoint_id.to_string(),
            })?;

        if waitpoint.is_completed() {
            debug!(waitpoint_id = %waitpoint_id, "waitpoint already completed");
        } else {
            let changed = self
                .persistence
                .complete_waitpoint(waitpoint_id, output.as_deref(), is_error, Utc::now())
                .await?;
            debug!(waitpoint_id = %waitpoint_id, changed, "waitpoint completed");
        }

        // Re-evaluated on repeats too, so a completion interrupted before the
        // runs were resumed is healed by the next delivery.
        self.resume_blocked_runs(waitpoint_id).await?;

        self.persistence
            .get_waitpoint(waitpoint_id)
            .await?
            .ok_or_else(|| EngineError::WaitpointNotFound {
                waitpoint_id: waitpoint_id.to_string(),
            })
    }

    async fn resume_blocked_runs(&self, waitpoint_id: &str) -> Result<()> {
        let run_ids = self.persistence.list_runs_blocked_on(waitpoint_id).await?;

        let mut first_error = None;
        for run_id in run_ids {
            let result = match self.locker.acquire(&run_id).await {
                Ok(guard) => {
                    let result = match self.get_run(&run_id).await {
                        Ok(run) => self.unblock_locked(&run).await.map(|_| ()),
                        Err(e) => Err(e),
                    };
                    guard.release().await;
                    result
                }
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                warn!(run_id = %run_id, waitpoint_id = %waitpoint_id, error = %e, "failed to resume blocked run");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Complete DATETIME waitpoints whose time has come.
    ///
    /// Returns how many were completed.
    #[instrument(skip(self))]
    pub async fn complete_due_date_time_waitpoints(&self, limit: i64) -> Result<usize> {
        let due = self
            .persistence
            .list_due_datetime_waitpoints(Utc::now(), limit)
            .await?;

        let mut completed = 0;
        for waitpoint in due {
            match self.complete_waitpoint(&waitpoint.id, None, false).await {
                Ok(_) => completed += 1,
                Err(e) => {
                    warn!(waitpoint_id = %waitpoint.id, error = %e, "failed to complete due waitpoint")
                }
            }
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::test_support::*;
    use crate::engine::{AttemptOutcome, ParentRun};
    use crate::error::EngineError;
    use chrono::Utc;

    #[tokio::test]
    async fn test_idempotency_key_returns_existing_waitpoint() {
        let engine = test_engine().await;
        let first = engine
            .create_manual_waitpoint("env-1", "proj-1", Some("approval-42"))
            .await
            .unwrap();
        let second = engine
            .create_manual_waitpoint("env-1", "proj-1", Some("approval-42"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.friendly_id.starts_with("waitpoint_"));

        let other_env = engine
            .create_manual_waitpoint("env-2", "proj-1", Some("approval-42"))
            .await
            .unwrap();
        assert_ne!(first.id, other_env.id);
    }

    #[tokio::test]
    async fn test_run_stays_blocked_until_all_completed() {
        let engine = test_engine().await;
        let (run_id, executing) = executing_run(&engine).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                engine
                    .create_manual_waitpoint("env-1", "proj-1", None)
                    .await
                    .unwrap()
                    .id,
            );
        }

        let blocked = engine.block_run_with_waitpoint(&run_id, &ids).await.unwrap();
        assert_eq!(blocked.status, "EXECUTING_WITH_WAITPOINTS");
        assert_ne!(blocked.id, executing);

        // Complete out of order.
        for id in [&ids[2], &ids[0]] {
            engine
                .complete_waitpoint(id, Some(b"ok".to_vec()), false)
                .await
                .unwrap();
            let run = engine.get_run(&run_id).await.unwrap();
            assert_eq!(run.status, "EXECUTING_WITH_WAITPOINTS");
        }

        engine
            .complete_waitpoint(&ids[1], Some(b"ok".to_vec()), false)
            .await
            .unwrap();
        let run = engine.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, "EXECUTING");
        assert_eq!(engine.persistence.count_pending_blocks(&run_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_completing_twice_is_a_no_op() {
        let engine = test_engine().await;
        let (run_id, _) = executing_run(&engine).await;
        let a = engine
            .create_manual_waitpoint("env-1", "proj-1", None)
            .await
            .unwrap();
        let b = engine
            .create_manual_waitpoint("env-1", "proj-1", None)
            .await
            .unwrap();
        engine
            .block_run_with_waitpoint(&run_id, &[a.id.clone(), b.id.clone()])
            .await
            .unwrap();

        let first = engine
            .complete_waitpoint(&a.id, Some(b"first".to_vec()), false)
            .await
            .unwrap();
        let second = engine
            .complete_waitpoint(&a.id, Some(b"second".to_vec()), true)
            .await
            .unwrap();
        assert_eq!(second.output.as_deref(), Some(&b"first"[..]));
        assert!(!second.output_is_error);
        assert_eq!(second.completed_at, first.completed_at);

        assert_eq!(engine.persistence.count_pending_blocks(&run_id).await.unwrap(), 1);
        assert_eq!(
            engine.get_run(&run_id).await.unwrap().status,
            "EXECUTING_WITH_WAITPOINTS"
        );
    }

    #[tokio::test]
    async fn test_blocking_on_completed_waitpoint_unblocks_immediately() {
        let engine = test_engine().await;
        let (run_id, _) = executing_run(&engine).await;
        let waitpoint = engine
            .create_manual_waitpoint("env-1", "proj-1", None)
            .await
            .unwrap();
        engine
            .complete_waitpoint(&waitpoint.id, None, false)
            .await
            .unwrap();

        let snapshot = engine
            .block_run_with_waitpoint(&run_id, &[waitpoint.id.clone()])
            .await
            .unwrap();
        assert_eq!(snapshot.status, "EXECUTING");
        assert_eq!(engine.get_run(&run_id).await.unwrap().status, "EXECUTING");
    }

    #[tokio::test]
    async fn test_block_errors() {
        let engine = test_engine().await;
        let (run_id, executing) = executing_run(&engine).await;

        let err = engine
            .block_run_with_waitpoint(&run_id, &["missing".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WaitpointNotFound { ref waitpoint_id } if waitpoint_id == "missing"));

        let waitpoint = engine
            .create_manual_waitpoint("env-1", "proj-1", None)
            .await
            .unwrap();
        engine
            .complete_run_attempt(&run_id, &executing, AttemptOutcome::Success { output: vec![] })
            .await
            .unwrap();
        let err = engine
            .block_run_with_waitpoint(&run_id, &[waitpoint.id.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RunNotBlockable { .. }));

        register_task(&engine, "email/send").await;
        let queued = engine.trigger_run(trigger("email/send")).await.unwrap();
        let err = engine
            .block_run_with_waitpoint(&queued.id, &[waitpoint.id])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { ref from, .. } if from == "QUEUED"));
    }

    #[tokio::test]
    async fn test_suspended_run_is_requeued_and_resumes_from_checkpoint() {
        let engine = test_engine().await;
        let (run_id, _) = executing_run(&engine).await;
        let waitpoint = engine
            .create_manual_waitpoint("env-1", "proj-1", None)
            .await
            .unwrap();
        let blocked = engine
            .block_run_with_waitpoint(&run_id, &[waitpoint.id.clone()])
            .await
            .unwrap();

        let suspended = engine
            .suspend_run(&run_id, &blocked.id, b"step-3".to_vec())
            .await
            .unwrap();
        assert_eq!(suspended.status, "SUSPENDED");
        assert!(suspended.checkpoint_id.is_some());
        // The slot is free while suspended.
        assert!(engine.dispatch.get_message(&run_id).await.unwrap().is_none());

        engine
            .complete_waitpoint(&waitpoint.id, Some(b"approved".to_vec()), false)
            .await
            .unwrap();
        assert_eq!(engine.get_run(&run_id).await.unwrap().status, "QUEUED");

        let dequeued = engine
            .dequeue_from_worker_queue("worker-2", "env-1", None)
            .await
            .unwrap();
        assert_eq!(dequeued.len(), 1);
        let attempt = engine
            .start_run_attempt(&run_id, &dequeued[0].snapshot_id)
            .await
            .unwrap();
        assert_eq!(attempt.attempt_number, 1);
        let checkpoint = attempt.checkpoint.expect("resume should load the checkpoint");
        assert_eq!(checkpoint.state, b"step-3".to_vec());
        assert_eq!(Some(checkpoint.checkpoint_id), suspended.checkpoint_id);
    }

    #[tokio::test]
    async fn test_child_run_completion_unblocks_parent() {
        let engine = test_engine().await;
        let (parent_id, _) = executing_run(&engine).await;

        let mut request = trigger("email/send");
        request.parent = Some(ParentRun {
            run_id: parent_id.clone(),
            block: true,
        });
        let child = engine.trigger_run(request).await.unwrap();
        assert_eq!(child.parent_run_id.as_deref(), Some(parent_id.as_str()));
        assert_eq!(
            engine.get_run(&parent_id).await.unwrap().status,
            "EXECUTING_WITH_WAITPOINTS"
        );

        let dequeued = engine
            .dequeue_from_worker_queue("worker-1", "env-1", None)
            .await
            .unwrap();
        let child_pending = dequeued.iter().find(|d| d.run.id == child.id).unwrap();
        let attempt = engine
            .start_run_attempt(&child.id, &child_pending.snapshot_id)
            .await
            .unwrap();
        engine
            .complete_run_attempt(
                &child.id,
                &attempt.snapshot.id,
                AttemptOutcome::Success {
                    output: b"child-output".to_vec(),
                },
            )
            .await
            .unwrap();

        assert_eq!(engine.get_run(&parent_id).await.unwrap().status, "EXECUTING");
        let waitpoint = engine
            .persistence
            .get_run_waitpoint(&child.id)
            .await
            .unwrap()
            .unwrap();
        assert!(waitpoint.is_completed());
        assert_eq!(waitpoint.output.as_deref(), Some(&b"child-output"[..]));
    }

    #[tokio::test]
    async fn test_due_datetime_waitpoints_are_completed() {
        let engine = test_engine().await;
        let due = engine
            .create_date_time_waitpoint(
                "env-1",
                "proj-1",
                Utc::now() - chrono::Duration::seconds(1),
                None,
            )
            .await
            .unwrap();
        let later = engine
            .create_date_time_waitpoint(
                "env-1",
                "proj-1",
                Utc::now() + chrono::Duration::hours(1),
                None,
            )
            .await
            .unwrap();

        assert_eq!(engine.complete_due_date_time_waitpoints(10).await.unwrap(), 1);
        assert!(
            engine
                .persistence
                .get_waitpoint(&due.id)
                .await
                .unwrap()
                .unwrap()
                .is_completed()
        );
        assert!(
            !engine
                .persistence
                .get_waitpoint(&later.id)
                .await
                .unwrap()
                .unwrap()
                .is_completed()
        );
        assert_eq!(engine.complete_due_date_time_waitpoints(10).await.unwrap(), 0);
    }
}
