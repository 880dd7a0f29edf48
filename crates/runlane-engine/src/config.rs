// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use crate::dispatch::DequeueStrategy;

/// Tunables used by [`crate::Engine`] itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a dispatch lease stays valid without a heartbeat.
    pub lease_ttl: Duration,
    /// How long a run lock is held before another writer may take it over.
    pub lock_ttl: Duration,
    /// How long a writer waits for a run lock before giving up.
    pub lock_acquire_timeout: Duration,
    /// Delay between lock acquisition attempts.
    pub lock_retry_delay: Duration,
    /// Runs moved per deploy-gated resume batch.
    pub deploy_batch_size: usize,
    /// Pause between two deploy-gated resume batches.
    pub deploy_stagger: Duration,
    /// Waitpoints fetched per query when loading the current snapshot's waitpoints.
    pub waitpoint_chunk_size: usize,
    /// Ordering used when several queues compete for slots.
    pub dequeue_strategy: DequeueStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(300),
            lock_ttl: Duration::from_secs(5),
            lock_acquire_timeout: Duration::from_secs(5),
            lock_retry_delay: Duration::from_millis(25),
            deploy_batch_size: 50,
            deploy_stagger: Duration::from_millis(250),
            waitpoint_chunk_size: 100,
            dequeue_strategy: DequeueStrategy::OldestFirst,
        }
    }
}

/// Runlane engine server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// HTTP API address
    pub http_addr: SocketAddr,
    /// Poll interval of the date-time waitpoint sweeper
    pub sweeper_poll_interval: Duration,
    /// Poll interval of the expired lease reclaimer
    pub reclaimer_poll_interval: Duration,
    /// Engine tunables
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `RUNLANE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `RUNLANE_HTTP_PORT`: HTTP API port (default: 8090)
    /// - `RUNLANE_LEASE_TTL_SECS`: dispatch lease TTL (default: 300)
    /// - `RUNLANE_LOCK_TTL_MS`: run lock TTL (default: 5000)
    /// - `RUNLANE_LOCK_TIMEOUT_MS`: run lock acquire timeout (default: 5000)
    /// - `RUNLANE_DEPLOY_BATCH_SIZE`: runs per resume batch (default: 50)
    /// - `RUNLANE_DEPLOY_STAGGER_MS`: delay between resume batches (default: 250)
    /// - `RUNLANE_WAITPOINT_CHUNK_SIZE`: waitpoints per fetch (default: 100)
    /// - `RUNLANE_DEQUEUE_STRATEGY`: `oldest_first` or `queue_round_robin` (default: oldest_first)
    /// - `RUNLANE_SWEEPER_POLL_MS`: waitpoint sweeper interval (default: 1000)
    /// - `RUNLANE_RECLAIMER_POLL_MS`: lease reclaimer interval (default: 5000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("RUNLANE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("RUNLANE_DATABASE_URL"))?;

        let http_port: u16 = parse_var("RUNLANE_HTTP_PORT", "8090", "must be a valid port number")?;

        let defaults = EngineConfig::default();

        let lease_ttl_secs: u64 =
            parse_var("RUNLANE_LEASE_TTL_SECS", "300", "must be a positive integer")?;
        let lock_ttl_ms: u64 =
            parse_var("RUNLANE_LOCK_TTL_MS", "5000", "must be a positive integer")?;
        let lock_timeout_ms: u64 =
            parse_var("RUNLANE_LOCK_TIMEOUT_MS", "5000", "must be a positive integer")?;
        let deploy_batch_size: usize =
            parse_var("RUNLANE_DEPLOY_BATCH_SIZE", "50", "must be a positive integer")?;
        let deploy_stagger_ms: u64 =
            parse_var("RUNLANE_DEPLOY_STAGGER_MS", "250", "must be a non-negative integer")?;
        let waitpoint_chunk_size: usize =
            parse_var("RUNLANE_WAITPOINT_CHUNK_SIZE", "100", "must be a positive integer")?;
        let sweeper_poll_ms: u64 =
            parse_var("RUNLANE_SWEEPER_POLL_MS", "1000", "must be a positive integer")?;
        let reclaimer_poll_ms: u64 =
            parse_var("RUNLANE_RECLAIMER_POLL_MS", "5000", "must be a positive integer")?;

        if lease_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "RUNLANE_LEASE_TTL_SECS",
                "must be a positive integer",
            ));
        }
        if deploy_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "RUNLANE_DEPLOY_BATCH_SIZE",
                "must be a positive integer",
            ));
        }
        if waitpoint_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "RUNLANE_WAITPOINT_CHUNK_SIZE",
                "must be a positive integer",
            ));
        }

        let dequeue_strategy = match std::env::var("RUNLANE_DEQUEUE_STRATEGY") {
            Ok(value) => value.parse().map_err(|_| {
                ConfigError::Invalid(
                    "RUNLANE_DEQUEUE_STRATEGY",
                    "must be 'oldest_first' or 'queue_round_robin'",
                )
            })?,
            Err(_) => defaults.dequeue_strategy,
        };

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            sweeper_poll_interval: Duration::from_millis(sweeper_poll_ms),
            reclaimer_poll_interval: Duration::from_millis(reclaimer_poll_ms),
            engine: EngineConfig {
                lease_ttl: Duration::from_secs(lease_ttl_secs),
                lock_ttl: Duration::from_millis(lock_ttl_ms),
                lock_acquire_timeout: Duration::from_millis(lock_timeout_ms),
                deploy_batch_size,
                deploy_stagger: Duration::from_millis(deploy_stagger_ms),
                waitpoint_chunk_size,
                dequeue_strategy,
                ..defaults
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    default: &str,
    message: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, message))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
