// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deploy-gated resume.
//!
//! When a worker supporting some tasks is deployed, runs parked in
//! WAITING_FOR_DEPLOY for those tasks are queued in bounded batches with a
//! stagger between batches. The selection predicate makes a drain safe to
//! repeat after a partial failure.

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::engine::{Engine, TransitionEffects};
use crate::error::Result;
use crate::types::{ExecutionStatus, task_queue_name};

/// Outcome of one drain batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployDrain {
    /// Runs selected for the batch.
    pub fetched: usize,
    /// Runs moved to QUEUED.
    pub resumed: usize,
    /// Whether another batch should follow.
    pub more: bool,
}

impl Engine {
    /// Queue one batch of runs waiting for a worker of the given tasks.
    #[instrument(skip(self, task_identifiers), fields(tasks = task_identifiers.len()))]
    pub async fn drain_deploy_batch(
        &self,
        environment_id: &str,
        task_identifiers: &[String],
    ) -> Result<DeployDrain> {
        let batch_size = self.config.deploy_batch_size.max(1);
        let runs = self
            .persistence
            .list_runs_waiting_for_deploy(environment_id, task_identifiers, batch_size as i64)
            .await?;
        let fetched = runs.len();

        let mut resumed = 0;
        for run in runs {
            let guard = match self.locker.acquire(&run.id).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "could not lock waiting run");
                    continue;
                }
            };
            let result = self.resume_waiting_locked(&run.id).await;
            guard.release().await;

            match result {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(e) => warn!(run_id = %run.id, error = %e, "failed to resume waiting run"),
            }
        }

        // A full batch that made no progress would be fetched again forever.
        let more = fetched == batch_size && resumed > 0;
        debug!(environment_id = %environment_id, fetched, resumed, more, "deploy batch drained");
        Ok(DeployDrain {
            fetched,
            resumed,
            more,
        })
    }

    async fn resume_waiting_locked(&self, run_id: &str) -> Result<bool> {
        let mut run = self.get_run(run_id).await?;
        if run.status()? != ExecutionStatus::WaitingForDeploy {
            return Ok(false);
        }

        // A run parked on its default queue follows the queue the deployed worker registered.
        if run.queue_name == task_queue_name(&run.task_identifier)
            && let Some(queue_name) = self
                .persistence
                .find_task_queue(&run.environment_id, &run.task_identifier)
                .await?
            && queue_name != run.queue_name
        {
            self.persistence.set_run_queue(&run.id, &queue_name).await?;
            debug!(run_id = %run.id, queue = %queue_name, "waiting run moved to registered queue");
            run.queue_name = queue_name;
        }

        self.apply_transition(
            &run,
            &run.current_snapshot_id,
            ExecutionStatus::Queued,
            "Worker deployed, run queued",
            TransitionEffects::default(),
        )
        .await?;
        self.enqueue_run(&run).await?;
        Ok(true)
    }

    /// Drain batches until one comes back short. Returns the number of runs queued.
    pub async fn resume_waiting_for_deploy(
        &self,
        environment_id: &str,
        task_identifiers: &[String],
    ) -> Result<usize> {
        if task_identifiers.is_empty() {
            return Ok(0);
        }

        let mut total = 0;
        loop {
            let drain = self
                .drain_deploy_batch(environment_id, task_identifiers)
                .await?;
            total += drain.resumed;
            if !drain.more {
                break;
            }
            tokio::time::sleep(self.config.deploy_stagger).await;
        }

        if total > 0 {
            info!(environment_id = %environment_id, resumed = total, "Resumed runs waiting for deploy");
        }
        Ok(total)
    }

    /// A worker for `environment_id` supporting `task_identifiers` now exists.
    ///
    /// The resume runs in the background; the handle yields the number of runs queued.
    pub fn worker_deployed(
        &self,
        environment_id: &str,
        task_identifiers: Vec<String>,
    ) -> JoinHandle<Result<usize>> {
        let engine = self.clone();
        let environment_id = environment_id.to_string();
        tokio::spawn(async move {
            engine
                .resume_waiting_for_deploy(&environment_id, &task_identifiers)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::engine::test_support::*;
    use crate::queues::{TaskRegistration, WorkerRegistration};

    #[tokio::test]
    async fn test_deploy_resumes_in_batches() {
        let engine = test_engine_with(EngineConfig {
            deploy_batch_size: 2,
            ..test_config()
        })
        .await;

        let mut waiting = Vec::new();
        for _ in 0..5 {
            waiting.push(engine.trigger_run(trigger("email/send")).await.unwrap().id);
        }
        let other = engine.trigger_run(trigger("report/build")).await.unwrap();

        let first = engine
            .drain_deploy_batch("env-1", &["email/send".to_string()])
            .await
            .unwrap();
        assert_eq!((first.fetched, first.resumed, first.more), (2, 2, true));

        register_task(&engine, "email/send").await;
        let resumed = engine
            .worker_deployed("env-1", vec!["email/send".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resumed, 3);

        for run_id in &waiting {
            assert_eq!(engine.get_run(run_id).await.unwrap().status, "QUEUED");
            assert!(engine.dispatch.get_message(run_id).await.unwrap().is_some());
        }
        assert_eq!(
            engine.get_run(&other.id).await.unwrap().status,
            "WAITING_FOR_DEPLOY"
        );

        // Re-running finds nothing left.
        let again = engine
            .resume_waiting_for_deploy("env-1", &["email/send".to_string()])
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_resume_is_oldest_first() {
        let engine = test_engine_with(EngineConfig {
            deploy_batch_size: 1,
            ..test_config()
        })
        .await;
        let oldest = engine.trigger_run(trigger("email/send")).await.unwrap();
        engine.trigger_run(trigger("email/send")).await.unwrap();

        let drain = engine
            .drain_deploy_batch("env-1", &["email/send".to_string()])
            .await
            .unwrap();
        assert_eq!(drain.resumed, 1);
        assert_eq!(engine.get_run(&oldest.id).await.unwrap().status, "QUEUED");
    }

    #[tokio::test]
    async fn test_waiting_runs_move_to_the_registered_named_queue() {
        let engine = test_engine().await;
        let first = engine.trigger_run(trigger("email/send")).await.unwrap();
        let second = engine.trigger_run(trigger("email/send")).await.unwrap();
        assert_eq!(first.queue_name, "task/email/send");

        let registered = engine
            .register_worker(WorkerRegistration {
                environment_id: "env-1".to_string(),
                version: "20250301.1".to_string(),
                tasks: vec![TaskRegistration {
                    task_identifier: "email/send".to_string(),
                    queue_name: Some("emails".to_string()),
                    concurrency_limit: Some(1),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(registered.resume.await.unwrap().unwrap(), 2);

        for run_id in [&first.id, &second.id] {
            let run = engine.get_run(run_id).await.unwrap();
            assert_eq!(run.status, "QUEUED");
            assert_eq!(run.queue_name, "emails");
            let message = engine.dispatch.get_message(run_id).await.unwrap().unwrap();
            assert_eq!(message.queue_name, "emails");
        }

        // The named queue's limit of one applies to both runs.
        let dequeued = engine
            .dequeue_from_worker_queue("worker-1", "env-1", Some(5))
            .await
            .unwrap();
        assert_eq!(dequeued.len(), 1);
    }
}
