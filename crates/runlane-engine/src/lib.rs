// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runlane Engine - Run Lifecycle and Dispatch
//!
//! This crate owns the lifecycle of task runs: creating them, handing them to
//! workers through a concurrency-limited dispatch queue, blocking them on
//! waitpoints, suspending and resuming them from checkpoints, and recording
//! every status change in an append-only snapshot log.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 HTTP API / embedding application                  │
//! └──────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                             Engine                                │
//! │   run lock  ·  state machine  ·  snapshot CAS  ·  waitpoints      │
//! └──────────────────────────────────────────────────────────────────┘
//!           │                                        │
//!           ▼                                        ▼
//! ┌───────────────────────┐              ┌───────────────────────────┐
//! │      Persistence      │              │      Dispatch queue       │
//! │ runs, snapshots, ...  │              │ leases, queue/env limits  │
//! └───────────────────────┘              └───────────────────────────┘
//!           │                                        │
//!           └──────────────► PostgreSQL / SQLite ◄───┘
//! ```
//!
//! # Run Statuses
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `RUN_CREATED` | Written, not yet admitted |
//! | `WAITING_FOR_DEPLOY` | No deployed worker supports the task |
//! | `QUEUED` | In the dispatch queue |
//! | `PENDING_EXECUTING` | Leased by a consumer, attempt not started |
//! | `EXECUTING` | Attempt running |
//! | `EXECUTING_WITH_WAITPOINTS` | Attempt running, blocked on waitpoints |
//! | `SUSPENDED` | Checkpointed, waiting for waitpoints |
//! | `FINISHED` / `FAILED` / `CANCELED` | Terminal |
//!
//! # Background Tasks
//!
//! [`runtime::EngineRuntime`] runs two pollers next to the engine: the
//! [`waitpoint_sweeper`] completing due date-time waitpoints and the
//! [`lease_reclaimer`] re-queueing runs whose dispatch lease expired.

/// Server configuration loaded from environment variables.
pub mod config;

/// Deploy-gated resume of runs waiting for a worker.
pub mod deploy;

/// Durable dispatch queue with queue, environment and concurrency-key limits.
pub mod dispatch;

/// Run lifecycle operations.
pub mod engine;

/// Error types with stable codes and retry classification.
pub mod error;

/// HTTP API over the engine operations.
#[cfg(feature = "http")]
pub mod http;

/// Background task re-queueing runs with expired leases.
pub mod lease_reclaimer;

/// Per-run mutual exclusion.
pub mod lock;

/// Embedded database migrations.
pub mod migrations;

/// Storage of runs, snapshots, waitpoints, queues and workers.
pub mod persistence;

/// Queue limits and worker registration.
pub mod queues;

/// Embeddable runtime with background tasks.
pub mod runtime;

/// Reads over the snapshot log.
pub mod snapshots;

/// Legal status transitions.
pub mod state_machine;

/// Shared enums and identifiers.
pub mod types;

/// Background task completing due date-time waitpoints.
pub mod waitpoint_sweeper;

/// Waitpoint creation, blocking and completion.
pub mod waitpoints;

pub use config::{Config, EngineConfig};
pub use dispatch::{DequeueStrategy, DispatchQueue, MAX_DEQUEUE_BATCH};
pub use engine::{
    AttemptContext, AttemptOutcome, DequeuedRun, Engine, ParentRun, TriggerRunRequest,
};
pub use error::{EngineError, ErrorKind, Result};
pub use persistence::Persistence;
pub use queues::{RegisteredWorker, TaskRegistration, WorkerRegistration};
pub use runtime::EngineRuntime;
pub use snapshots::SnapshotView;
pub use types::{ExecutionStatus, QueueKind, WaitpointKind, WaitpointStatus};
