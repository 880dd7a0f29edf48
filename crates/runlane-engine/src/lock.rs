// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run mutual exclusion.
//!
//! A lock is a row in `run_locks` holding an owner token and an expiry. Taking
//! the lock succeeds when no row exists or the existing row has expired, so a
//! crashed holder never blocks a run for longer than the lock TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::persistence::Persistence;
use crate::types::new_id;

/// Acquires run locks against the shared store.
#[derive(Clone)]
pub struct RunLocker {
    persistence: Arc<dyn Persistence>,
    ttl: Duration,
    acquire_timeout: Duration,
    retry_delay: Duration,
}

impl RunLocker {
    pub fn new(persistence: Arc<dyn Persistence>, config: &EngineConfig) -> Self {
        Self {
            persistence,
            ttl: config.lock_ttl,
            acquire_timeout: config.lock_acquire_timeout,
            retry_delay: config.lock_retry_delay,
        }
    }

    /// Take the lock for `run_id`, retrying until the acquire timeout elapses.
    pub async fn acquire(&self, run_id: &str) -> Result<RunLockGuard> {
        let owner = new_id();
        let started = Instant::now();
        let ttl = ChronoDuration::from_std(self.ttl).unwrap_or_else(|_| ChronoDuration::seconds(0));

        loop {
            let now = Utc::now();
            if self
                .persistence
                .try_acquire_run_lock(run_id, &owner, now, now + ttl)
                .await?
            {
                debug!(run_id = %run_id, owner = %owner, "run lock acquired");
                return Ok(RunLockGuard {
                    persistence: self.persistence.clone(),
                    run_id: run_id.to_string(),
                    owner,
                    released: false,
                });
            }

            let waited = started.elapsed();
            if waited >= self.acquire_timeout {
                return Err(EngineError::LockTimeout {
                    run_id: run_id.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

/// A held run lock. Call [`RunLockGuard::release`] when done.
///
/// Dropping an unreleased guard releases the lock in a background task.
pub struct RunLockGuard {
    persistence: Arc<dyn Persistence>,
    run_id: String,
    owner: String,
    released: bool,
}

impl RunLockGuard {
    /// Owner token of this acquisition.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Release the lock. A lock that already expired and was taken over is left alone.
    pub async fn release(mut self) {
        self.released = true;
        match self
            .persistence
            .release_run_lock(&self.run_id, &self.owner)
            .await
        {
            Ok(true) => debug!(run_id = %self.run_id, "run lock released"),
            Ok(false) => warn!(run_id = %self.run_id, "run lock expired before release"),
            Err(e) => warn!(run_id = %self.run_id, error = %e, "failed to release run lock"),
        }
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let persistence = self.persistence.clone();
        let run_id = std::mem::take(&mut self.run_id);
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            if let Err(e) = persistence.release_run_lock(&run_id, &owner).await {
                warn!(run_id = %run_id, error = %e, "failed to release dropped run lock");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_persistence() -> Arc<dyn Persistence> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        Arc::new(SqlitePersistence::new(pool))
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            lock_ttl: Duration::from_secs(5),
            lock_acquire_timeout: Duration::from_millis(100),
            lock_retry_delay: Duration::from_millis(10),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let locker = RunLocker::new(test_persistence().await, &fast_config());

        let guard = locker.acquire("run-1").await.unwrap();
        let err = locker.acquire("run-1").await.err().unwrap();
        assert!(matches!(err, EngineError::LockTimeout { .. }));
        assert!(err.is_transient());

        // Other runs are independent.
        let other = locker.acquire("run-2").await.unwrap();
        other.release().await;
        guard.release().await;
    }

    #[tokio::test]
    async fn test_release_allows_next_writer() {
        let locker = RunLocker::new(test_persistence().await, &fast_config());

        let first = locker.acquire("run-1").await.unwrap();
        let first_owner = first.owner().to_string();
        first.release().await;

        let second = locker.acquire("run-1").await.unwrap();
        assert_ne!(second.owner(), first_owner);
        second.release().await;
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let config = EngineConfig {
            lock_acquire_timeout: Duration::from_secs(2),
            ..fast_config()
        };
        let locker = RunLocker::new(test_persistence().await, &config);

        let guard = locker.acquire("run-1").await.unwrap();
        let waiter = {
            let locker = locker.clone();
            tokio::spawn(async move { locker.acquire("run-1").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        guard.release().await;

        let acquired = waiter.await.unwrap().unwrap();
        assert_eq!(acquired.run_id(), "run-1");
        acquired.release().await;
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let config = EngineConfig {
            lock_ttl: Duration::from_millis(30),
            lock_acquire_timeout: Duration::from_secs(1),
            ..fast_config()
        };
        let locker = RunLocker::new(test_persistence().await, &config);

        let stale = locker.acquire("run-1").await.unwrap();
        let fresh = locker.acquire("run-1").await.unwrap();
        assert_ne!(stale.owner(), fresh.owner());

        // The stale holder must not release the new owner's lock.
        stale.release().await;
        assert!(
            locker
                .persistence
                .release_run_lock("run-1", fresh.owner())
                .await
                .unwrap()
        );
        fresh.release().await;
    }
}
