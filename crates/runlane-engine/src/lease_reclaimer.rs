// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Expired lease reclaimer.
//!
//! A worker that dies without acknowledging its message keeps the slot until
//! the lease expires. This task returns such messages to the queue and moves
//! their runs back to QUEUED.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use crate::engine::{DEFAULT_RECLAIM_BATCH, Engine};

/// Lease reclaimer configuration.
#[derive(Debug, Clone)]
pub struct LeaseReclaimerConfig {
    /// How often to look for expired leases
    pub poll_interval: Duration,
    /// Maximum leases reclaimed per poll
    pub batch_size: i64,
}

impl Default for LeaseReclaimerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: DEFAULT_RECLAIM_BATCH,
        }
    }
}

/// Background task reclaiming expired dispatch leases.
pub struct LeaseReclaimer {
    engine: Engine,
    config: LeaseReclaimerConfig,
    shutdown: Arc<Notify>,
}

impl LeaseReclaimer {
    pub fn new(engine: Engine, config: LeaseReclaimerConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reclaimer loop until shutdown is signaled.
    pub async fn run(self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Lease reclaimer started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Lease reclaimer shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.engine.reclaim_expired_leases(self.config.batch_size).await {
                        error!(error = %e, "Failed to reclaim expired leases");
                    }
                }
            }
        }
    }
}
