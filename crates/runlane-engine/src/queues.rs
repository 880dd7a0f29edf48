// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue limits and background worker registration.

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::persistence::{BackgroundWorkerRecord, EnvironmentCeilingsRecord, QueueRecord};
use crate::types::{QueueKind, task_queue_name};

/// A task offered by a registering worker.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistration {
    pub task_identifier: String,
    /// Named queue; the task's virtual queue when absent.
    pub queue_name: Option<String>,
    /// Requested concurrency limit; unlimited when absent.
    pub concurrency_limit: Option<i64>,
    pub rate_limit_count: Option<i64>,
    pub rate_limit_period_ms: Option<i64>,
}

/// Input of [`Engine::register_worker`].
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistration {
    pub environment_id: String,
    pub version: String,
    pub tasks: Vec<TaskRegistration>,
    /// Environment-wide concurrency ceiling.
    pub environment_max: Option<i64>,
    /// Organization-wide concurrency ceiling.
    pub organization_max: Option<i64>,
}

/// Outcome of [`Engine::register_worker`].
#[derive(Debug)]
pub struct RegisteredWorker {
    pub worker: BackgroundWorkerRecord,
    pub queues: Vec<QueueRecord>,
    /// Resume of runs that were waiting for this deployment.
    pub resume: JoinHandle<Result<usize>>,
}

/// Clamp a requested limit by the environment and organization ceilings.
///
/// `None` means unlimited; the environment ceiling is enforced on its own by
/// the environment limit.
pub fn effective_limit(
    requested: Option<i64>,
    environment_max: Option<i64>,
    organization_max: Option<i64>,
) -> Option<i64> {
    requested.map(|requested| clamp_limit(requested, environment_max, organization_max))
}

fn clamp_limit(requested: i64, environment_max: Option<i64>, organization_max: Option<i64>) -> i64 {
    [environment_max, organization_max]
        .into_iter()
        .flatten()
        .fold(requested.max(0), |limit, max| limit.min(max.max(0)))
}

impl Engine {
    /// Set the concurrency limit of a queue. Applies to subsequent dequeues.
    ///
    /// The limit is clamped by the environment and organization ceilings last
    /// recorded for the environment; the requested value is kept alongside.
    #[instrument(skip(self))]
    pub async fn update_queue_concurrency_limits(
        &self,
        environment_id: &str,
        queue_name: &str,
        limit: i64,
    ) -> Result<()> {
        if limit < 0 {
            return Err(EngineError::validation(
                "concurrency_limit",
                "must not be negative",
            ));
        }
        let ceilings = self
            .persistence
            .get_environment_ceilings(environment_id)
            .await?;
        let (environment_max, organization_max) = ceilings
            .map(|c| (c.environment_max, c.organization_max))
            .unwrap_or_default();
        let effective = clamp_limit(limit, environment_max, organization_max);

        self.dispatch
            .set_queue_limit(environment_id, queue_name, effective)
            .await?;
        self.persistence
            .set_queue_concurrency_limit(environment_id, queue_name, Some(limit), Some(effective))
            .await?;
        info!(
            environment_id = %environment_id,
            queue = %queue_name,
            requested = limit,
            limit = effective,
            "Queue limit updated"
        );
        Ok(())
    }

    /// Make a queue unlimited.
    #[instrument(skip(self))]
    pub async fn remove_queue_concurrency_limits(
        &self,
        environment_id: &str,
        queue_name: &str,
    ) -> Result<()> {
        self.dispatch
            .remove_queue_limit(environment_id, queue_name)
            .await?;
        self.persistence
            .set_queue_concurrency_limit(environment_id, queue_name, None, None)
            .await?;
        info!(environment_id = %environment_id, queue = %queue_name, "Queue limit removed");
        Ok(())
    }

    /// Set (or with `None`, remove) the environment-wide limit.
    #[instrument(skip(self))]
    pub async fn update_env_concurrency_limits(
        &self,
        environment_id: &str,
        limit: Option<i64>,
    ) -> Result<()> {
        if limit.is_some_and(|l| l < 0) {
            return Err(EngineError::validation(
                "concurrency_limit",
                "must not be negative",
            ));
        }
        self.dispatch.set_env_limit(environment_id, limit).await?;
        let organization_max = self
            .persistence
            .get_environment_ceilings(environment_id)
            .await?
            .and_then(|c| c.organization_max);
        self.persistence
            .upsert_environment_ceilings(&EnvironmentCeilingsRecord {
                environment_id: environment_id.to_string(),
                environment_max: limit,
                organization_max,
                updated_at: Utc::now(),
            })
            .await?;
        info!(environment_id = %environment_id, limit = ?limit, "Environment limit updated");
        Ok(())
    }

    /// Register a deployed worker, set up its queues and resume runs that were
    /// waiting for it.
    #[instrument(skip(self, registration), fields(environment_id = %registration.environment_id, version = %registration.version))]
    pub async fn register_worker(&self, registration: WorkerRegistration) -> Result<RegisteredWorker> {
        if registration.environment_id.is_empty() {
            return Err(EngineError::validation("environment_id", "is required"));
        }
        if registration.version.is_empty() {
            return Err(EngineError::validation("version", "is required"));
        }
        if let Some(task) = registration
            .tasks
            .iter()
            .find(|t| t.task_identifier.is_empty())
        {
            return Err(EngineError::validation(
                "task_identifier",
                format!("empty task identifier (queue {:?})", task.queue_name),
            ));
        }

        let env = registration.environment_id.as_str();
        let now = Utc::now();
        self.persistence
            .upsert_environment_ceilings(&EnvironmentCeilingsRecord {
                environment_id: env.to_string(),
                environment_max: registration.environment_max,
                organization_max: registration.organization_max,
                updated_at: now,
            })
            .await?;
        let mut task_queues = Vec::with_capacity(registration.tasks.len());
        let mut queues = Vec::with_capacity(registration.tasks.len());

        for task in &registration.tasks {
            let (name, kind) = match &task.queue_name {
                Some(name) => (name.clone(), QueueKind::Named),
                None => (task_queue_name(&task.task_identifier), QueueKind::Virtual),
            };
            let limit = effective_limit(
                task.concurrency_limit,
                registration.environment_max,
                registration.organization_max,
            );

            let queue = QueueRecord {
                environment_id: env.to_string(),
                name: name.clone(),
                kind: kind.as_str().to_string(),
                requested_limit: task.concurrency_limit,
                concurrency_limit: limit,
                rate_limit_count: task.rate_limit_count,
                rate_limit_period_ms: task.rate_limit_period_ms,
                created_at: now,
                updated_at: now,
            };
            self.persistence.upsert_queue(&queue).await?;
            match limit {
                Some(limit) => self.dispatch.set_queue_limit(env, &name, limit).await?,
                None => {
                    self.dispatch.remove_queue_limit(env, &name).await?;
                }
            }

            task_queues.push((task.task_identifier.clone(), name));
            queues.push(queue);
        }

        if registration.environment_max.is_some() {
            self.dispatch
                .set_env_limit(env, registration.environment_max.map(|m| m.max(0)))
                .await?;
        }

        let worker = self
            .persistence
            .upsert_background_worker(env, &registration.version, &task_queues)
            .await?;
        info!(worker_id = %worker.id, tasks = task_queues.len(), "Background worker registered");

        let task_identifiers = task_queues.into_iter().map(|(task, _)| task).collect();
        let resume = self.worker_deployed(env, task_identifiers);

        Ok(RegisteredWorker {
            worker,
            queues,
            resume,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::*;

    #[test]
    fn test_effective_limit_clamping() {
        assert_eq!(effective_limit(None, Some(10), Some(5)), None);
        assert_eq!(effective_limit(Some(20), None, None), Some(20));
        assert_eq!(effective_limit(Some(20), Some(10), None), Some(10));
        assert_eq!(effective_limit(Some(20), Some(10), Some(5)), Some(5));
        assert_eq!(effective_limit(Some(3), Some(10), Some(5)), Some(3));
        assert_eq!(effective_limit(Some(-1), None, None), Some(0));
    }

    #[tokio::test]
    async fn test_register_worker_creates_clamped_queues() {
        let engine = test_engine().await;
        let registered = engine
            .register_worker(WorkerRegistration {
                environment_id: "env-1".to_string(),
                version: "20250301.1".to_string(),
                tasks: vec![
                    TaskRegistration {
                        task_identifier: "email/send".to_string(),
                        concurrency_limit: Some(50),
                        ..Default::default()
                    },
                    TaskRegistration {
                        task_identifier: "report/build".to_string(),
                        queue_name: Some("reports".to_string()),
                        concurrency_limit: Some(2),
                        rate_limit_count: Some(10),
                        rate_limit_period_ms: Some(60_000),
                    },
                ],
                environment_max: Some(20),
                organization_max: Some(100),
            })
            .await
            .unwrap();
        assert_eq!(registered.resume.await.unwrap().unwrap(), 0);

        let email = engine
            .persistence
            .get_queue("env-1", "task/email/send")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(email.kind, "VIRTUAL");
        assert_eq!(email.requested_limit, Some(50));
        assert_eq!(email.concurrency_limit, Some(20));

        let reports = engine
            .persistence
            .get_queue("env-1", "reports")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reports.kind, "NAMED");
        assert_eq!(reports.concurrency_limit, Some(2));
        assert_eq!(reports.rate_limit_count, Some(10));

        let tasks = engine
            .persistence
            .list_worker_tasks(&registered.worker.id)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(
            engine
                .persistence
                .environment_supports_task("env-1", "report/build")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_queue_limit_gates_dequeue() {
        let engine = test_engine().await;
        register_task(&engine, "email/send").await;
        engine
            .update_queue_concurrency_limits("env-1", "task/email/send", 1)
            .await
            .unwrap();

        for _ in 0..3 {
            engine.trigger_run(trigger("email/send")).await.unwrap();
        }
        let first = engine
            .dequeue_from_worker_queue("worker-1", "env-1", None)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(
            engine
                .dequeue_from_worker_queue("worker-1", "env-1", None)
                .await
                .unwrap()
                .is_empty()
        );

        engine
            .remove_queue_concurrency_limits("env-1", "task/email/send")
            .await
            .unwrap();
        let rest = engine
            .dequeue_from_worker_queue("worker-1", "env-1", None)
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn test_env_limit_and_validation() {
        let engine = test_engine().await;
        register_task(&engine, "email/send").await;
        engine
            .update_env_concurrency_limits("env-1", Some(0))
            .await
            .unwrap();
        engine.trigger_run(trigger("email/send")).await.unwrap();
        assert!(
            engine
                .dequeue_from_worker_queue("worker-1", "env-1", None)
                .await
                .unwrap()
                .is_empty()
        );

        engine.update_env_concurrency_limits("env-1", None).await.unwrap();
        assert_eq!(
            engine
                .dequeue_from_worker_queue("worker-1", "env-1", None)
                .await
                .unwrap()
                .len(),
            1
        );

        let err = engine
            .update_queue_concurrency_limits("env-1", "task/email/send", -1)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_queue_limit_update_is_clamped_by_ceilings() {
        let engine = test_engine().await;
        let registered = engine
            .register_worker(WorkerRegistration {
                environment_id: "env-1".to_string(),
                version: "20250301.1".to_string(),
                tasks: vec![TaskRegistration {
                    task_identifier: "email/send".to_string(),
                    concurrency_limit: Some(2),
                    ..Default::default()
                }],
                environment_max: Some(10),
                organization_max: Some(4),
            })
            .await
            .unwrap();
        registered.resume.await.unwrap().unwrap();

        engine
            .update_queue_concurrency_limits("env-1", "task/email/send", 50)
            .await
            .unwrap();
        let queue = engine
            .persistence
            .get_queue("env-1", "task/email/send")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.requested_limit, Some(50));
        assert_eq!(queue.concurrency_limit, Some(4));

        for _ in 0..6 {
            engine.trigger_run(trigger("email/send")).await.unwrap();
        }
        let dequeued = engine
            .dequeue_from_worker_queue("worker-1", "env-1", Some(10))
            .await
            .unwrap();
        assert_eq!(dequeued.len(), 4);

        // A lower environment limit becomes the new ceiling for later updates.
        engine
            .update_env_concurrency_limits("env-1", Some(3))
            .await
            .unwrap();
        engine
            .update_queue_concurrency_limits("env-1", "task/email/send", 50)
            .await
            .unwrap();
        let queue = engine
            .persistence
            .get_queue("env-1", "task/email/send")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.concurrency_limit, Some(3));
    }
}
