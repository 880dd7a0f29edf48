// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end run lifecycle tests on SQLite.

mod common;

use std::time::Duration;

use common::*;
use futures::future::join_all;
use runlane_engine::{
    AttemptOutcome, Engine, EngineConfig, ParentRun, TaskRegistration, WorkerRegistration,
};

#[tokio::test]
async fn test_run_waits_for_deploy_then_completes() {
    let engine = sqlite_engine(test_config()).await;

    let run = engine.trigger_run(trigger("env-1", "orders/sync")).await.unwrap();
    assert_eq!(run.status, "WAITING_FOR_DEPLOY");
    assert!(
        engine
            .dequeue_from_worker_queue("consumer-1", "env-1", None)
            .await
            .unwrap()
            .is_empty()
    );

    register_task(&engine, "env-1", "orders/sync", None).await;
    assert_eq!(engine.get_run(&run.id).await.unwrap().status, "QUEUED");

    let dequeued = engine
        .dequeue_from_worker_queue("consumer-1", "env-1", None)
        .await
        .unwrap();
    assert_eq!(dequeued.len(), 1);
    let attempt = engine
        .start_run_attempt(&run.id, &dequeued[0].snapshot_id)
        .await
        .unwrap();
    assert_eq!(attempt.attempt_number, 1);
    assert!(attempt.checkpoint.is_none());

    let finished = engine
        .complete_run_attempt(
            &run.id,
            &attempt.snapshot.id,
            AttemptOutcome::Success {
                output: b"{\"synced\":3}".to_vec(),
            },
        )
        .await
        .unwrap();
    assert_eq!(finished.status, "FINISHED");
    assert_eq!(finished.output.as_deref(), Some(&b"{\"synced\":3}"[..]));
    assert!(engine.dispatch().get_message(&run.id).await.unwrap().is_none());

    let statuses: Vec<String> = engine
        .list_snapshots(&run.id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            "RUN_CREATED",
            "WAITING_FOR_DEPLOY",
            "QUEUED",
            "PENDING_EXECUTING",
            "EXECUTING",
            "FINISHED"
        ]
    );
}

#[tokio::test]
async fn test_queue_limit_holds_under_concurrent_consumers() {
    let engine = sqlite_engine(test_config()).await;
    register_task(&engine, "env-1", "orders/sync", Some(3)).await;
    for _ in 0..20 {
        engine.trigger_run(trigger("env-1", "orders/sync")).await.unwrap();
    }

    let consumers = (0..8).map(|i| {
        let engine = engine.clone();
        async move {
            engine
                .dequeue_from_worker_queue(&format!("consumer-{i}"), "env-1", Some(5))
                .await
                .unwrap()
        }
    });
    let batches = join_all(consumers).await;
    let leased: Vec<_> = batches.into_iter().flatten().collect();
    assert_eq!(leased.len(), 3);
    assert_eq!(
        engine
            .dispatch()
            .count_leased("env-1", Some("task/orders/sync"))
            .await
            .unwrap(),
        3
    );

    // Finishing one run frees exactly one slot.
    let first = &leased[0];
    let attempt = engine
        .start_run_attempt(&first.run.id, &first.snapshot_id)
        .await
        .unwrap();
    engine
        .complete_run_attempt(
            &first.run.id,
            &attempt.snapshot.id,
            AttemptOutcome::Failure {
                error: "upstream timeout".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(engine.get_run(&first.run.id).await.unwrap().status, "FAILED");

    let next = engine
        .dequeue_from_worker_queue("consumer-9", "env-1", Some(5))
        .await
        .unwrap();
    assert_eq!(next.len(), 1);
}

async fn register_worker_tasks(engine: &Engine, tasks: Vec<TaskRegistration>) {
    let registered = engine
        .register_worker(WorkerRegistration {
            environment_id: "env-1".to_string(),
            version: "20250301.1".to_string(),
            tasks,
            ..Default::default()
        })
        .await
        .unwrap();
    registered.resume.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_saturated_queue_backlog_does_not_block_other_queues() {
    let engine = sqlite_engine(test_config()).await;
    register_worker_tasks(
        &engine,
        vec![
            TaskRegistration {
                task_identifier: "orders/sync".to_string(),
                concurrency_limit: Some(1),
                ..Default::default()
            },
            TaskRegistration {
                task_identifier: "emails/send".to_string(),
                ..Default::default()
            },
        ],
    )
    .await;

    for _ in 0..250 {
        engine.trigger_run(trigger("env-1", "orders/sync")).await.unwrap();
    }
    let email = engine.trigger_run(trigger("env-1", "emails/send")).await.unwrap();

    let first = engine
        .dequeue_from_worker_queue("consumer-1", "env-1", Some(1))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].run.task_identifier, "orders/sync");

    // 249 older runs wait on the saturated queue; the newer email run is still served.
    let second = engine
        .dequeue_from_worker_queue("consumer-2", "env-1", Some(1))
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].run.id, email.id);
}

#[tokio::test]
async fn test_tasks_sharing_a_named_queue_share_its_limit() {
    let engine = sqlite_engine(test_config()).await;
    register_worker_tasks(
        &engine,
        vec![
            TaskRegistration {
                task_identifier: "orders/sync".to_string(),
                queue_name: Some("orders".to_string()),
                concurrency_limit: Some(2),
                ..Default::default()
            },
            TaskRegistration {
                task_identifier: "orders/refund".to_string(),
                queue_name: Some("orders".to_string()),
                concurrency_limit: Some(2),
                ..Default::default()
            },
        ],
    )
    .await;

    for task in ["orders/sync", "orders/refund", "orders/sync", "orders/refund"] {
        let run = engine.trigger_run(trigger("env-1", task)).await.unwrap();
        assert_eq!(run.queue_name, "orders");
    }

    let consumers = (0..4).map(|i| {
        let engine = engine.clone();
        async move {
            engine
                .dequeue_from_worker_queue(&format!("consumer-{i}"), "env-1", Some(5))
                .await
                .unwrap()
        }
    });
    let leased: Vec<_> = join_all(consumers).await.into_iter().flatten().collect();
    assert_eq!(leased.len(), 2);
    assert_eq!(
        engine
            .dispatch()
            .count_leased("env-1", Some("orders"))
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed_and_redelivered() {
    let engine = sqlite_engine(EngineConfig {
        lease_ttl: Duration::from_millis(30),
        ..test_config()
    })
    .await;
    let (run_id, _) = executing_run(&engine, "env-1").await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(engine.reclaim_expired_leases(10).await.unwrap(), 1);
    assert_eq!(engine.get_run(&run_id).await.unwrap().status, "QUEUED");

    let redelivered = engine
        .dequeue_from_worker_queue("consumer-2", "env-1", None)
        .await
        .unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].message.delivery_count, 2);

    let attempt = engine
        .start_run_attempt(&run_id, &redelivered[0].snapshot_id)
        .await
        .unwrap();
    assert_eq!(attempt.attempt_number, 2);
}

#[tokio::test]
async fn test_suspended_run_resumes_from_checkpoint() {
    let engine = sqlite_engine(test_config()).await;
    let (run_id, executing) = executing_run(&engine, "env-1").await;

    let waitpoint = engine
        .create_manual_waitpoint("env-1", TEST_PROJECT, Some("approval-1"))
        .await
        .unwrap();
    let blocked = engine
        .block_run_with_waitpoint(&run_id, &[waitpoint.id.clone()])
        .await
        .unwrap();
    assert_ne!(blocked.id, executing);

    let suspended = engine
        .suspend_run(&run_id, &blocked.id, b"{\"step\":4}".to_vec())
        .await
        .unwrap();
    assert_eq!(suspended.status, "SUSPENDED");
    assert!(engine.dispatch().get_message(&run_id).await.unwrap().is_none());

    engine
        .complete_waitpoint(&waitpoint.id, Some(b"\"approved\"".to_vec()), false)
        .await
        .unwrap();
    assert_eq!(engine.get_run(&run_id).await.unwrap().status, "QUEUED");

    let dequeued = engine
        .dequeue_from_worker_queue("consumer-1", "env-1", None)
        .await
        .unwrap();
    let attempt = engine
        .start_run_attempt(&run_id, &dequeued[0].snapshot_id)
        .await
        .unwrap();
    assert_eq!(attempt.attempt_number, 1);
    let checkpoint = attempt.checkpoint.expect("checkpoint should be loaded");
    assert_eq!(checkpoint.state, b"{\"step\":4}".to_vec());
}

#[tokio::test]
async fn test_canceling_child_unblocks_parent() {
    let engine = sqlite_engine(test_config()).await;
    let (parent_id, _) = executing_run(&engine, "env-1").await;

    let child = engine
        .trigger_run(runlane_engine::TriggerRunRequest {
            parent: Some(ParentRun {
                run_id: parent_id.clone(),
                block: true,
            }),
            ..trigger("env-1", "orders/sync")
        })
        .await
        .unwrap();
    assert_eq!(
        engine.get_run(&parent_id).await.unwrap().status,
        "EXECUTING_WITH_WAITPOINTS"
    );

    let canceled = engine.cancel_run(&child.id, "superseded by newer sync").await.unwrap();
    assert_eq!(canceled.status, "CANCELED");
    assert_eq!(canceled.error.as_deref(), Some("superseded by newer sync"));
    assert!(engine.dispatch().get_message(&child.id).await.unwrap().is_none());

    let latest = engine.get_latest_snapshot(&parent_id).await.unwrap();
    assert_eq!(latest.snapshot.status, "EXECUTING");
    assert_eq!(latest.waitpoints.len(), 1);
    assert!(latest.waitpoints[0].output_is_error);
    assert_eq!(
        latest.waitpoints[0].completed_by_run_id.as_deref(),
        Some(child.id.as_str())
    );
}
