// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine tests against PostgreSQL.
//!
//! Run with TEST_DATABASE_URL pointing at a scratch database; skipped otherwise.

mod common;

use common::*;
use futures::future::join_all;
use runlane_engine::AttemptOutcome;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_lifecycle_with_waitpoints() {
    skip_if_no_db!();
    let Some(engine) = postgres_engine(test_config()).await else {
        eprintln!("Skipping test: could not connect to TEST_DATABASE_URL");
        return;
    };
    let env = unique_env();
    let (run_id, executing) = executing_run(&engine, &env).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            engine
                .create_manual_waitpoint(&env, TEST_PROJECT, None)
                .await
                .unwrap()
                .id,
        );
    }
    engine.block_run_with_waitpoint(&run_id, &ids).await.unwrap();
    for id in &ids {
        engine
            .complete_waitpoint(id, Some(b"1".to_vec()), false)
            .await
            .unwrap();
    }

    let since = engine
        .get_snapshots_since(&run_id, &executing)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(since.len(), 2);
    assert!(since[0].waitpoints.is_empty());
    assert_eq!(since[1].waitpoints.len(), 3);

    let finished = engine
        .complete_run_attempt(
            &run_id,
            &since[1].snapshot.id,
            AttemptOutcome::Success {
                output: b"{}".to_vec(),
            },
        )
        .await
        .unwrap();
    assert_eq!(finished.status, "FINISHED");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_queue_limit_across_consumers() {
    skip_if_no_db!();
    let Some(engine) = postgres_engine(test_config()).await else {
        eprintln!("Skipping test: could not connect to TEST_DATABASE_URL");
        return;
    };
    let env = unique_env();
    register_task(&engine, &env, "orders/sync", Some(3)).await;
    for _ in 0..12 {
        engine.trigger_run(trigger(&env, "orders/sync")).await.unwrap();
    }

    let consumers = (0..8).map(|i| {
        let engine = engine.clone();
        let env = env.clone();
        tokio::spawn(async move {
            engine
                .dequeue_from_worker_queue(&format!("consumer-{i}"), &env, Some(4))
                .await
                .unwrap()
                .len()
        })
    });
    let leased: usize = join_all(consumers)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .sum();
    assert_eq!(leased, 3);
    assert_eq!(
        engine
            .dispatch()
            .count_leased(&env, Some("task/orders/sync"))
            .await
            .unwrap(),
        3
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_concurrent_writers_one_wins() {
    skip_if_no_db!();
    let Some(engine) = postgres_engine(test_config()).await else {
        eprintln!("Skipping test: could not connect to TEST_DATABASE_URL");
        return;
    };
    let env = unique_env();
    let (run_id, executing) = executing_run(&engine, &env).await;

    let writers = (0..4).map(|i| {
        let engine = engine.clone();
        let run_id = run_id.clone();
        let executing = executing.clone();
        tokio::spawn(async move {
            engine
                .complete_run_attempt(
                    &run_id,
                    &executing,
                    AttemptOutcome::Success {
                        output: format!("{i}").into_bytes(),
                    },
                )
                .await
        })
    });
    let results: Vec<_> = join_all(writers)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e.error_code(), "SNAPSHOT_STALE" | "RUN_TERMINAL"))
    );
}
