// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Date-time waitpoint sweeper.
//!
//! Periodically completes DATETIME waitpoints whose `complete_after` has
//! passed, which resumes the runs blocked on them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::engine::Engine;

/// Waitpoint sweeper configuration.
#[derive(Debug, Clone)]
pub struct WaitpointSweeperConfig {
    /// How often to look for due waitpoints
    pub poll_interval: Duration,
    /// Maximum waitpoints completed per poll
    pub batch_size: i64,
}

impl Default for WaitpointSweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// Background task completing due date-time waitpoints.
pub struct WaitpointSweeper {
    engine: Engine,
    config: WaitpointSweeperConfig,
    shutdown: Arc<Notify>,
}

impl WaitpointSweeper {
    pub fn new(engine: Engine, config: WaitpointSweeperConfig) -> Self {
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

    /// Run the sweeper loop until shutdown is signaled.
    pub async fn run(self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Waitpoint sweeper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Waitpoint sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.sweep_once().await;
                }
            }
        }
    }

    /// Complete one batch of due waitpoints.
    pub async fn sweep_once(&self) -> usize {
        match self
            .engine
            .complete_due_date_time_waitpoints(self.config.batch_size)
            .await
        {
            Ok(0) => 0,
            Ok(completed) => {
                debug!(completed, "Completed due date-time waitpoints");
                completed
            }
            Err(e) => {
                error!(error = %e, "Failed to complete due waitpoints");
                0
            }
        }
    }
}
