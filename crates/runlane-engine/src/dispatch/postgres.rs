// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed dispatch queue.
//!
//! A dequeue takes a transaction-scoped advisory lock per candidate environment
//! (in sorted order) before counting slots, so concurrent consumers of the same
//! environment see each other's leases.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use crate::error::Result;

use super::{
    DequeueRequest, DispatchMessage, DispatchQueue, EnqueueRequest, SlotState, select_admissible,
};

/// PostgreSQL-backed dispatch queue.
#[derive(Clone)]
pub struct PostgresDispatchQueue {
    pool: PgPool,
}

impl PostgresDispatchQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Dequeue helpers
// ============================================================================

async fn lock_environments(conn: &mut PgConnection, environments: &[String]) -> Result<()> {
    for env in environments {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended('runlane.dispatch:' || $1, 0))")
            .bind(env)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn load_slots(conn: &mut PgConnection, environments: &[String]) -> Result<SlotState> {
    let mut slots = SlotState::default();

    let env_limits: Vec<(String, i64)> = sqlx::query_as(
        "SELECT environment_id, concurrency_limit FROM dispatch_env_limits WHERE environment_id = ANY($1)",
    )
    .bind(environments)
    .fetch_all(&mut *conn)
    .await?;
    slots.env_limits.extend(env_limits);

    let queue_limits: Vec<(String, String, i64)> = sqlx::query_as(
        r#"
        SELECT environment_id, queue_name, concurrency_limit
        FROM dispatch_queue_limits
        WHERE environment_id = ANY($1)
        "#,
    )
    .bind(environments)
    .fetch_all(&mut *conn)
    .await?;
    for (env, queue, limit) in queue_limits {
        slots.queue_limits.insert((env, queue), limit);
    }

    let in_flight: Vec<(String, String, i64)> = sqlx::query_as(
        r#"
        SELECT environment_id, queue_name, COUNT(*)
        FROM dispatch_messages
        WHERE status = 'leased' AND environment_id = ANY($1)
        GROUP BY environment_id, queue_name
        "#,
    )
    .bind(environments)
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
        WHERE status = 'leased'
          AND concurrency_key IS NOT NULL
          AND environment_id = ANY($1)
        "#,
    )
    .bind(environments)
    .fetch_all(&mut *conn)
    .await?;
    slots.busy_keys.extend(busy);

    Ok(slots)
}

/// Lease admissible messages for one consumer.
/// Queued, available messages of the worker queue in the locked environments that
/// are not blocked by a saturated queue, a saturated environment or a busy
/// concurrency key.
async fn fetch_candidate_page(
    conn: &mut PgConnection,
    request: &DequeueRequest,
    environments: &[String],
    page_size: i64,
    offset: i64,
) -> Result<Vec<DispatchMessage>> {
    let page = sqlx::query_as::<_, DispatchMessage>(
        r#"
        WITH leased AS (
            SELECT environment_id, queue_name, concurrency_key
            FROM dispatch_messages
            WHERE status = 'leased' AND environment_id = ANY($3)
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
        WHERE m.worker_queue = $1
          AND m.status = 'queued'
          AND m.available_at <= $2
          AND m.environment_id = ANY($3)
          AND (ql.concurrency_limit IS NULL OR COALESCE(qu.used, 0) < ql.concurrency_limit)
          AND (el.concurrency_limit IS NULL OR COALESCE(eu.used, 0) < el.concurrency_limit)
          AND (m.concurrency_key IS NULL OR NOT EXISTS (
              SELECT 1 FROM leased l
              WHERE l.environment_id = m.environment_id
                AND l.queue_name = m.queue_name
                AND l.concurrency_key = m.concurrency_key
          ))
        ORDER BY m.enqueued_at ASC, m.run_id ASC
        LIMIT $4 OFFSET $5
        "#,
    )
    .bind(&request.worker_queue)
    .bind(request.now)
    .bind(environments)
    .bind(page_size)
    .bind(offset)
    .fetch_all(&mut *conn)
    .await?;
    Ok(page)
}

pub async fn dequeue(pool: &PgPool, request: &DequeueRequest) -> Result<Vec<DispatchMessage>> {
    let mut tx = pool.begin().await?;

    let mut environments: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT environment_id FROM dispatch_messages
        WHERE worker_queue = $1 AND status = 'queued' AND available_at <= $2
        "#,
    )
    .bind(&request.worker_queue)
    .bind(request.now)
    .fetch_all(&mut *tx)
    .await?;

    if environments.is_empty() {
        tx.commit().await?;
        return Ok(Vec::new());
    }
    environments.sort();
    lock_environments(&mut tx, &environments).await?;

    // Read under the locks; another consumer may have leased rows meanwhile.
    let mut slots = load_slots(&mut tx, &environments).await?;
    let page_size = request.page_size();
    let mut run_ids: Vec<String> = Vec::new();
    let mut scanned = 0usize;
    let mut offset = 0i64;
    while run_ids.len() < request.max_messages {
        let page = fetch_candidate_page(&mut tx, request, &environments, page_size, offset).await?;
        scanned += page.len();
        let remaining = request.max_messages - run_ids.len();
        for idx in select_admissible(&page, &mut slots, remaining, request.strategy) {
            run_ids.push(page[idx].run_id.clone());
        }
        if (page.len() as i64) < page_size {
            break;
        }
        offset += page_size;
    }
    if run_ids.is_empty() {
        tx.commit().await?;
        return Ok(Vec::new());
    }

    let mut leased = sqlx::query_as::<_, DispatchMessage>(
        r#"
        UPDATE dispatch_messages
        SET status = 'leased',
            lease_owner = $1,
            lease_expires_at = $2,
            delivery_count = delivery_count + 1
        WHERE run_id = ANY($3) AND status = 'queued'
        RETURNING *
        "#,
    )
    .bind(&request.consumer_id)
    .bind(request.lease_expires_at())
    .bind(&run_ids)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    // RETURNING order is unspecified; hand messages back in admission order.
    leased.sort_by_key(|m| run_ids.iter().position(|id| id == &m.run_id));
    debug!(
        worker_queue = %request.worker_queue,
        candidates = scanned,
        leased = leased.len(),
        "dequeued messages"
    );
    Ok(leased)
}

// ============================================================================
// Message operations
// ============================================================================

pub async fn enqueue(pool: &PgPool, request: &EnqueueRequest) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO dispatch_messages
            (run_id, environment_id, queue_name, worker_queue, concurrency_key, payload,
             status, enqueued_at, available_at, lease_owner, lease_expires_at, delivery_count)
        VALUES ($1, $2, $3, $4, $5, $6, 'queued', $7, $8, NULL, NULL, 0)
        ON CONFLICT (run_id) DO UPDATE
        SET environment_id = EXCLUDED.environment_id,
            queue_name = EXCLUDED.queue_name,
            worker_queue = EXCLUDED.worker_queue,
            concurrency_key = EXCLUDED.concurrency_key,
            payload = EXCLUDED.payload,
            status = 'queued',
            available_at = EXCLUDED.available_at,
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
    .bind(Utc::now())
    .bind(request.available_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_message(pool: &PgPool, run_id: &str) -> Result<Option<DispatchMessage>> {
    let message =
        sqlx::query_as::<_, DispatchMessage>("SELECT * FROM dispatch_messages WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(pool)
            .await?;
    Ok(message)
}

pub async fn extend_lease(
    pool: &PgPool,
    run_id: &str,
    lease_expires_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE dispatch_messages SET lease_expires_at = $2 WHERE run_id = $1 AND status = 'leased'",
    )
    .bind(run_id)
    .bind(lease_expires_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn acknowledge(pool: &PgPool, run_id: &str) -> Result<bool> {
    let result =
        sqlx::query("DELETE FROM dispatch_messages WHERE run_id = $1 AND status = 'leased'")
            .bind(run_id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn release(pool: &PgPool, run_id: &str, available_at: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE dispatch_messages
        SET status = 'queued',
            available_at = $2,
            lease_owner = NULL,
            lease_expires_at = NULL
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .bind(available_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_expired_leases(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<DispatchMessage>> {
    let messages = sqlx::query_as::<_, DispatchMessage>(
        r#"
        SELECT * FROM dispatch_messages
        WHERE status = 'leased' AND lease_expires_at <= $1
        ORDER BY lease_expires_at ASC
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(messages)
}

pub async fn remove(pool: &PgPool, run_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM dispatch_messages WHERE run_id = $1")
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Limits
// ============================================================================

pub async fn set_queue_limit(
    pool: &PgPool,
    environment_id: &str,
    queue_name: &str,
    limit: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO dispatch_queue_limits (environment_id, queue_name, concurrency_limit)
        VALUES ($1, $2, $3)
        ON CONFLICT (environment_id, queue_name) DO UPDATE
        SET concurrency_limit = EXCLUDED.concurrency_limit
        "#,
    )
    .bind(environment_id)
    .bind(queue_name)
    .bind(limit)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn remove_queue_limit(pool: &PgPool, environment_id: &str, queue_name: &str) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM dispatch_queue_limits WHERE environment_id = $1 AND queue_name = $2",
    )
    .bind(environment_id)
    .bind(queue_name)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_env_limit(pool: &PgPool, environment_id: &str, limit: Option<i64>) -> Result<()> {
    match limit {
        Some(limit) => {
            sqlx::query(
                r#"
                INSERT INTO dispatch_env_limits (environment_id, concurrency_limit)
                VALUES ($1, $2)
                ON CONFLICT (environment_id) DO UPDATE
                SET concurrency_limit = EXCLUDED.concurrency_limit
                "#,
            )
            .bind(environment_id)
            .bind(limit)
            .execute(pool)
            .await?;
        }
        None => {
            sqlx::query("DELETE FROM dispatch_env_limits WHERE environment_id = $1")
                .bind(environment_id)
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

pub async fn count_leased(
    pool: &PgPool,
    environment_id: &str,
    queue_name: Option<&str>,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM dispatch_messages
        WHERE status = 'leased'
          AND environment_id = $1
          AND ($2::text IS NULL OR queue_name = $2)
        "#,
    )
    .bind(environment_id)
    .bind(queue_name)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

// ============================================================================
// Trait implementation
// ============================================================================

#[async_trait]
impl DispatchQueue for PostgresDispatchQueue {
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<()> {
        enqueue(&self.pool, request).await
    }

    async fn dequeue(&self, request: &DequeueRequest) -> Result<Vec<DispatchMessage>> {
        dequeue(&self.pool, request).await
    }

    async fn get_message(&self, run_id: &str) -> Result<Option<DispatchMessage>> {
        get_message(&self.pool, run_id).await
    }

    async fn extend_lease(&self, run_id: &str, lease_expires_at: DateTime<Utc>) -> Result<bool> {
        extend_lease(&self.pool, run_id, lease_expires_at).await
    }

    async fn acknowledge(&self, run_id: &str) -> Result<bool> {
        acknowledge(&self.pool, run_id).await
    }

    async fn release(&self, run_id: &str, available_at: DateTime<Utc>) -> Result<bool> {
        release(&self.pool, run_id, available_at).await
    }

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DispatchMessage>> {
        list_expired_leases(&self.pool, now, limit).await
    }

    async fn remove(&self, run_id: &str) -> Result<bool> {
        remove(&self.pool, run_id).await
    }

    async fn set_queue_limit(
        &self,
        environment_id: &str,
        queue_name: &str,
        limit: i64,
    ) -> Result<()> {
        set_queue_limit(&self.pool, environment_id, queue_name, limit).await
    }

    async fn remove_queue_limit(&self, environment_id: &str, queue_name: &str) -> Result<bool> {
        remove_queue_limit(&self.pool, environment_id, queue_name).await
    }

    async fn set_env_limit(&self, environment_id: &str, limit: Option<i64>) -> Result<()> {
        set_env_limit(&self.pool, environment_id, limit).await
    }

    async fn count_leased(&self, environment_id: &str, queue_name: Option<&str>) -> Result<i64> {
        count_leased(&self.pool, environment_id, queue_name).await
    }
}
