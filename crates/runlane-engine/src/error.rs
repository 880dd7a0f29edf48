// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the run engine.
//!
//! Every engine operation returns [`EngineError`]. Each variant carries a stable
//! machine-readable code (see [`EngineError::error_code`]) and belongs to one
//! [`ErrorKind`] that tells the caller how to react.

use thiserror::Error;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// How a caller is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is wrong. Never retried automatically.
    Validation,
    /// Another writer changed the run first. Refetch state and retry the
    /// intended operation, not the identical write.
    Contention,
    /// A shared resource is unavailable. Retry with backoff.
    Resource,
}

/// Engine errors that can occur while processing a request.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Run was not found.
    #[error("Run '{run_id}' not found")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Waitpoint was not found.
    #[error("Waitpoint '{waitpoint_id}' not found")]
    WaitpointNotFound {
        /// The waitpoint ID that was not found.
        waitpoint_id: String,
    },

    /// Snapshot was not found for the run.
    #[error("Snapshot '{snapshot_id}' not found for run '{run_id}'")]
    SnapshotNotFound {
        /// The run ID.
        run_id: String,
        /// The snapshot ID that was not found.
        snapshot_id: String,
    },

    /// The requested transition is not legal from the run's current status.
    #[error("Run '{run_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// The run ID.
        run_id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// The run cannot be blocked on waitpoints.
    #[error("Run '{run_id}' cannot be blocked: already {status}")]
    RunNotBlockable {
        /// The run ID.
        run_id: String,
        /// Current (terminal) status.
        status: String,
    },

    /// The run already reached a terminal status.
    #[error("Run '{run_id}' is already {status}")]
    RunTerminal {
        /// The run ID.
        run_id: String,
        /// Terminal status.
        status: String,
    },

    /// The caller presented a snapshot that is no longer current.
    #[error(
        "Snapshot '{presented}' is stale for run '{run_id}' (current is '{current}'); refetch the run state and retry"
    )]
    SnapshotStale {
        /// The run ID.
        run_id: String,
        /// Snapshot ID the caller presented.
        presented: String,
        /// Actual current snapshot ID.
        current: String,
    },

    /// The run lock could not be acquired in time.
    #[error("Timed out after {waited_ms}ms acquiring lock for run '{run_id}'")]
    LockTimeout {
        /// The run ID.
        run_id: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::WaitpointNotFound { .. } => "WAITPOINT_NOT_FOUND",
            Self::SnapshotNotFound { .. } => "SNAPSHOT_NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::RunNotBlockable { .. } => "RUN_NOT_BLOCKABLE",
            Self::RunTerminal { .. } => "RUN_TERMINAL",
            Self::SnapshotStale { .. } => "SNAPSHOT_STALE",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SnapshotStale { .. } => ErrorKind::Contention,
            Self::LockTimeout { .. } | Self::Database { .. } => ErrorKind::Resource,
            _ => ErrorKind::Validation,
        }
    }

    /// Whether the caller may retry after backing off.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Resource
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn database(operation: &str, details: impl ToString) -> Self {
        Self::Database {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Database {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
