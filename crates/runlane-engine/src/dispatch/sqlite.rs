// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed dispatch queue.
//!
//! SQLite has no row locks, so leasing is serialized by a store-level write gate
//! held for the whole dequeue transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

use super::{
    DequeueRequest, DispatchMessage, DispatchQueue, EnqueueRequest, SlotState, select_admissible,
};

/// SQLite-backed dispatch queue.
#[derive(Clone)]
pub struct SqliteDispatchQueue {
    pool: SqlitePool,
    write_gate: Arc<Mutex<()>>,
}

impl SqliteDispatchQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_gate: Arc::new(Mutex::new(())),
        }
    }
}

async fn load_slots(conn: &mut SqliteConnection) -> Result<SlotState> {
    let mut slots = SlotState::default();

    let env_limits: Vec<(String, i64)> =
        sqlx::query_as("SELECT environment_id, concurrency_limit FROM dispatch_env_limits")
            .fetch_all(&mut *conn)
            .await?;
    slots.env_limits.extend(env_limits);

    let queue_limits: Vec<(String, String, i64)> = sqlx::query_as(
        "SELECT environment_id, queue_name, concurrency_limit FROM dispatch_queue_limits",
    )
    .fetch_all(&mut *conn)
    .await?;
    for (env, queue, limit) in queue_limits {
        slots.queue_limits.insert((env, queue), limit);
    }

    let in_flight: Vec<(String, String, i64)> = sqlx::query_as(
        r#"
        SELECT environment_id, queue_name, COUNT(*)
        FROM dispatch_messages
        WHERE status = 'leased'
        GROUP BY environment_id, queue_name
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;
    for (env, queue, count) in in_flight {
        *slots.env_in_flight.entry(env.clone()).or_insert(0) += count;
        slots.queue_in_flight.insert((env, queue), count);
    }

    let busy: Vec<(String, String, String)> = sqlx::query_as(
        r#"
        SELECT DISTINCT environment_id, queue_name, concurrency_key
        FROM dispatch_messages
        WHERE status = 'leased' AND concurrency_key IS NOT NULL
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;
    slots.busy_keys.extend(busy);

    Ok(slots)
}

/// Queued, available messages of the worker queue that are not blocked by a
/// saturated queue, a saturated environment or a busy concurrency key.
const CANDIDATE_PAGE_SQL: &str = r#"
    WITH leased AS (
        SELECT environment_id, queue_name, concurrency_key
        FROM dispatch_messages
        WHERE status = 'leased'
    ),
    queue_used AS (
        SELECT environment_id, queue_name, COUNT(*) AS used
        FROM leased
        GROUP BY environment_id, queue_name
    ),
    env_used AS (
        SELECT environment_id, COUNT(*) AS used
        FROM leased
        GROUP BY environment_id
    )
    SELECT m.*
    FROM dispatch_messages m
    LEFT JOIN dispatch_queue_limits ql
        ON ql.environment_id = m.environment_id AND ql.queue_name = m.queue_name
    LEFT JOIN queue_used qu
        ON qu.environment_id = m.environment_id AND qu.queue_name = m.queue_name
    LEFT JOIN dispatch_env_limits el ON el.environment_id = m.environment_id
    LEFT JOIN env_used eu ON eu.environment_id = m.environment_id
    WHERE m.worker_queue = ?
      AND m.status = 'queued'
      AND m.available_at <= ?
      AND (ql.concurrency_limit IS NULL OR COALESCE(qu.used, 0) < ql.concurrency_limit)
      AND (el.concurrency_limit IS NULL OR COALESCE(eu.used, 0) < el.concurrency_limit)
      AND (m.concurrency_key IS NULL OR NOT EXISTS (
          SELECT 1 FROM leased l
          WHERE l.environment_id = m.environment_id
            AND l.queue_name = m.queue_name
            AND l.concurrency_key = m.concurrency_key
      ))
    ORDER BY m.enqueued_at ASC, m.run_id ASC
    LIMIT ? OFFSET ?
"#;

async fn fetch_candidate_page(
    conn: &mut SqliteConnection,
    request: &DequeueRequest,
    page_size: i64,
    offset: i64,
) -> Result<Vec<DispatchMessage>> {
    let page = sqlx::query_as::<_, DispatchMessage>(CANDIDATE_PAGE_SQL)
        .bind(&request.worker_queue)
        .bind(request.now)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?;
    Ok(page)
}

#[async_trait]
impl DispatchQueue for SqliteDispatchQueue {
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO dispatch_messages
                (run_id, environment_id, queue_name, worker_queue, concurrency_key, payload,
                 status, enqueued_at, available_at, lease_owner, lease_expires_at, delivery_count)
            VALUES (?, ?, ?, ?, ?, ?, 'queued', ?, ?, NULL, NULL, 0)
            ON CONFLICT (run_id) DO UPDATE
            SET environment_id = excluded.environment_id,
                queue_name = excluded.queue_name,
                worker_queue = excluded.worker_queue,
                concurrency_key = excluded.concurrency_key,
                payload = excluded.payload,
                status = 'queued',
                available_at = excluded.available_at,
                lease_owner = NULL,
                lease_expires_at = NULL
            "#,
        )
        .bind(&request.run_id)
        .bind(&request.environment_id)
        .bind(&request.queue_name)
        .bind(&request.worker_queue)
        .bind(&request.concurrency_key)
        .bind(&request.payload)
        .bind(now)
        .bind(request.available_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dequeue(&self, request: &DequeueRequest) -> Result<Vec<DispatchMessage>> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut slots = load_slots(&mut tx).await?;
        let page_size = request.page_size();
        let mut picked: Vec<DispatchMessage> = Vec::new();
        let mut scanned = 0usize;
        let mut offset = 0i64;
        while picked.len() < request.max_messages {
            let page = fetch_candidate_page(&mut tx, request, page_size, offset).await?;
            scanned += page.len();
            let remaining = request.max_messages - picked.len();
            for idx in select_admissible(&page, &mut slots, remaining, request.strategy) {
                picked.push(page[idx].clone());
            }
            if (page.len() as i64) < page_size {
                break;
            }
            offset += page_size;
        }

        if picked.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let lease_expires_at = request.lease_expires_at();
        let mut leased = Vec::with_capacity(picked.len());
        for mut message in picked {
            let updated = sqlx::query(
                r#"
                UPDATE dispatch_messages
                SET status = 'leased',
                    lease_owner = ?,
                    lease_expires_at = ?,
                    delivery_count = delivery_count + 1
                WHERE run_id = ? AND status = 'queued'
                "#,
            )
            .bind(&request.consumer_id)
            .bind(lease_expires_at)
            .bind(&message.run_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 1 {
                message.status = "leased".to_string();
                message.lease_owner = Some(request.consumer_id.clone());
                message.lease_expires_at = Some(lease_expires_at);
                message.delivery_count += 1;
                leased.push(message);
            }
        }

        tx.commit().await?;
        debug!(
            worker_queue = %request.worker_queue,
            candidates = scanned,
            leased = leased.len(),
            "dequeued messages"
        );
        Ok(leased)
    }

    async fn get_message(&self, run_id: &str) -> Result<Option<DispatchMessage>> {
        let message =
            sqlx::query_as::<_, DispatchMessage>("SELECT * FROM dispatch_messages WHERE run_id = ?")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(message)
    }

    async fn extend_lease(&self, run_id: &str, lease_expires_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_messages
            SET lease_expires_at = ?
            WHERE run_id = ? AND status = 'leased'
            "#,
        )
        .bind(lease_expires_at)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn acknowledge(&self, run_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM dispatch_messages WHERE run_id = ? AND status = 'leased'")
                .bind(run_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, run_id: &str, available_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_messages
            SET status = 'queued',
                available_at = ?,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE run_id = ?
            "#,
        )
        .bind(available_at)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DispatchMessage>> {
        let messages = sqlx::query_as::<_, DispatchMessage>(
            r#"
            SELECT * FROM dispatch_messages
            WHERE status = 'leased' AND lease_expires_at <= ?
            ORDER BY lease_expires_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    async fn remove(&self, run_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dispatch_messages WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_queue_limit(
        &self,
        environment_id: &str,
        queue_name: &str,
        limit: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_queue_limits (environment_id, queue_name, concurrency_limit)
            VALUES (?, ?, ?)
            ON CONFLICT (environment_id, queue_name) DO UPDATE
            SET concurrency_limit = excluded.concurrency_limit
            "#,
        )
        .bind(environment_id)
        .bind(queue_name)
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_queue_limit(&self, environment_id: &str, queue_name: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM dispatch_queue_limits WHERE environment_id = ? AND queue_name = ?",
        )
        .bind(environment_id)
        .bind(queue_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_env_limit(&self, environment_id: &str, limit: Option<i64>) -> Result<()> {
        match limit {
            Some(limit) => {
                sqlx::query(
                    r#"
                    INSERT INTO dispatch_env_limits (environment_id, concurrency_limit)
                    VALUES (?, ?)
                    ON CONFLICT (environment_id) DO UPDATE
                    SET concurrency_limit = excluded.concurrency_limit
                    "#,
                )
                .bind(environment_id)
                .bind(limit)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM dispatch_env_limits WHERE environment_id = ?")
                    .bind(environment_id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn count_leased(&self, environment_id: &str, queue_name: Option<&str>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM dispatch_messages
            WHERE status = 'leased'
              AND environment_id = ?
              AND (? IS NULL OR queue_name = ?)
            "#,
        )
        .bind(environment_id)
        .bind(queue_name)
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
