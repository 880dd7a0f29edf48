// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the run engine.
//!
//! [`EngineRuntime`] owns an [`Engine`] plus its background tasks, so a host
//! application can run the engine inside its own tokio runtime instead of the
//! standalone server.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runlane_engine::dispatch::postgres::PostgresDispatchQueue;
//! use runlane_engine::persistence::postgres::PostgresPersistence;
//! use runlane_engine::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     runlane_engine::migrations::run_postgres(&pool).await?;
//!
//!     let runtime = EngineRuntime::builder()
//!         .persistence(Arc::new(PostgresPersistence::new(pool.clone())))
//!         .dispatch(Arc::new(PostgresDispatchQueue::new(pool)))
//!         .http_addr("0.0.0.0:8080".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let run = runtime.engine().trigger_run(request).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "http")]
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
#[cfg(feature = "http")]
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{Config, EngineConfig};
use crate::dispatch::DispatchQueue;
use crate::engine::Engine;
use crate::lease_reclaimer::{LeaseReclaimer, LeaseReclaimerConfig};
use crate::persistence::Persistence;
use crate::waitpoint_sweeper::{WaitpointSweeper, WaitpointSweeperConfig};

/// Builder for creating an [`EngineRuntime`].
#[derive(Default)]
pub struct EngineRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    dispatch: Option<Arc<dyn DispatchQueue>>,
    engine_config: EngineConfig,
    sweeper_config: WaitpointSweeperConfig,
    reclaimer_config: LeaseReclaimerConfig,
    #[cfg(feature = "http")]
    http_addr: Option<SocketAddr>,
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take engine tunables, poll intervals and the HTTP address from a server [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.engine_config = config.engine.clone();
        self.sweeper_config.poll_interval = config.sweeper_poll_interval;
        self.reclaimer_config.poll_interval = config.reclaimer_poll_interval;
        #[cfg(feature = "http")]
        {
            self.http_addr = Some(config.http_addr);
        }
        self
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the dispatch queue (required).
    pub fn dispatch(mut self, dispatch: Arc<dyn DispatchQueue>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Set the engine tunables.
    ///
    /// Default: [`EngineConfig::default()`]
    pub fn engine_config(mut self, config: EngineConfig) -> Self {
        self.engine_config = config;
        self
    }

    /// Set the date-time waitpoint sweeper poll interval.
    ///
    /// Default: 1 second
    pub fn sweeper_poll_interval(mut self, interval: Duration) -> Self {
        self.sweeper_config.poll_interval = interval;
        self
    }

    /// Set the expired lease reclaimer poll interval.
    ///
    /// Default: 5 seconds
    pub fn reclaimer_poll_interval(mut self, interval: Duration) -> Self {
        self.reclaimer_config.poll_interval = interval;
        self
    }

    /// Serve the HTTP API on this address. Port 0 picks a free port.
    ///
    /// Default: `None` (no HTTP server)
    #[cfg(feature = "http")]
    pub fn http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = Some(addr);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let dispatch = self
            .dispatch
            .ok_or_else(|| anyhow::anyhow!("dispatch is required"))?;
        if self.engine_config.waitpoint_chunk_size == 0 {
            anyhow::bail!("waitpoint_chunk_size must be positive");
        }
        if self.engine_config.deploy_batch_size == 0 {
            anyhow::bail!("deploy_batch_size must be positive");
        }

        Ok(EngineRuntimeConfig {
            persistence,
            dispatch,
            engine_config: self.engine_config,
            sweeper_config: self.sweeper_config,
            reclaimer_config: self.reclaimer_config,
            #[cfg(feature = "http")]
            http_addr: self.http_addr,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    dispatch: Arc<dyn DispatchQueue>,
    engine_config: EngineConfig,
    sweeper_config: WaitpointSweeperConfig,
    reclaimer_config: LeaseReclaimerConfig,
    #[cfg(feature = "http")]
    http_addr: Option<SocketAddr>,
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning the sweeper, the reclaimer and the HTTP server.
    pub async fn start(self) -> Result<EngineRuntime> {
        let engine = Engine::new(self.persistence, self.dispatch, self.engine_config);

        let sweeper = WaitpointSweeper::new(engine.clone(), self.sweeper_config);
        let sweeper_shutdown = sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(async move {
            sweeper.run().await;
        });

        let reclaimer = LeaseReclaimer::new(engine.clone(), self.reclaimer_config);
        let reclaimer_shutdown = reclaimer.shutdown_handle();
        let reclaimer_handle = tokio::spawn(async move {
            reclaimer.run().await;
        });

        #[cfg(feature = "http")]
        let server = match self.http_addr {
            Some(addr) => {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                let local_addr = listener.local_addr()?;
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let handle = tokio::spawn(crate::http::serve(listener, engine.clone(), shutdown_rx));
                Some(ServerTask {
                    handle,
                    shutdown_tx,
                    local_addr,
                })
            }
            None => None,
        };

        info!("EngineRuntime started");

        Ok(EngineRuntime {
            engine,
            sweeper_handle,
            reclaimer_handle,
            sweeper_shutdown,
            reclaimer_shutdown,
            #[cfg(feature = "http")]
            server,
        })
    }
}

#[cfg(feature = "http")]
struct ServerTask {
    handle: JoinHandle<Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
}

/// A running engine with its background tasks.
///
/// The runtime manages:
/// - Date-time waitpoint sweeper
/// - Expired lease reclaimer
/// - HTTP API (optional, when an address is configured)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    engine: Engine,
    sweeper_handle: JoinHandle<()>,
    reclaimer_handle: JoinHandle<()>,
    sweeper_shutdown: Arc<Notify>,
    reclaimer_shutdown: Arc<Notify>,
    #[cfg(feature = "http")]
    server: Option<ServerTask>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// The engine driven by this runtime.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Address the HTTP API is bound to, if it was started.
    #[cfg(feature = "http")]
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr)
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the HTTP server, sweeper and reclaimer to stop, then waits for them.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        #[cfg(feature = "http")]
        if let Some(server) = &self.server {
            let _ = server.shutdown_tx.send(true);
        }
        self.sweeper_shutdown.notify_one();
        self.reclaimer_shutdown.notify_one();

        if let Err(e) = self.sweeper_handle.await {
            error!("Waitpoint sweeper task panicked: {}", e);
        }
        if let Err(e) = self.reclaimer_handle.await {
            error!("Lease reclaimer task panicked: {}", e);
        }

        #[cfg(feature = "http")]
        if let Some(server) = self.server {
            match server.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("HTTP server error during shutdown: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("HTTP server task panicked: {}", e);
                    return Err(anyhow::anyhow!("server task panicked: {}", e));
                }
            }
        }

        info!("EngineRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        #[cfg(feature = "http")]
        let server_running = self
            .server
            .as_ref()
            .is_none_or(|s| !s.handle.is_finished());
        #[cfg(not(feature = "http"))]
        let server_running = true;

        server_running && !self.sweeper_handle.is_finished() && !self.reclaimer_handle.is_finished()
    }
}
