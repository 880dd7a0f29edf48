// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status enums and identifier helpers shared across the engine.
//!
//! Records coming out of persistence keep their status columns as plain strings;
//! these enums are the typed view used by the state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Execution status of a run, as recorded on each snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Run exists but has not been handed to the dispatch queue.
    RunCreated,
    /// Waiting in the dispatch queue for a free slot.
    Queued,
    /// Leased by a worker, attempt not started yet.
    PendingExecuting,
    /// Attempt is running on a worker.
    Executing,
    /// Attempt is running but blocked on one or more waitpoints.
    ExecutingWithWaitpoints,
    /// Blocked, checkpointed and off the worker.
    Suspended,
    /// Parked until a worker supporting the task is deployed.
    WaitingForDeploy,
    /// Completed successfully.
    Finished,
    /// Completed with an error.
    Failed,
    /// Canceled before completing.
    Canceled,
}

impl ExecutionStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [ExecutionStatus; 10] = [
        Self::RunCreated,
        Self::Queued,
        Self::PendingExecuting,
        Self::Executing,
        Self::ExecutingWithWaitpoints,
        Self::Suspended,
        Self::WaitingForDeploy,
        Self::Finished,
        Self::Failed,
        Self::Canceled,
    ];

    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "RUN_CREATED",
            Self::Queued => "QUEUED",
            Self::PendingExecuting => "PENDING_EXECUTING",
            Self::Executing => "EXECUTING",
            Self::ExecutingWithWaitpoints => "EXECUTING_WITH_WAITPOINTS",
            Self::Suspended => "SUSPENDED",
            Self::WaitingForDeploy => "WAITING_FOR_DEPLOY",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    /// Terminal statuses accept no further snapshots.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }

    /// Statuses in which a worker holds the dispatch lease for the run.
    pub fn holds_lease(&self) -> bool {
        matches!(
            self,
            Self::PendingExecuting | Self::Executing | Self::ExecutingWithWaitpoints
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| EngineError::database("decode_status", format!("unknown status '{s}'")))
    }
}

/// Kind of condition a waitpoint represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitpointKind {
    /// Completed by an explicit API call.
    Manual,
    /// Completed by the sweeper once `complete_after` has passed.
    Datetime,
    /// Completed when the associated run reaches a terminal status.
    Run,
}

impl WaitpointKind {
    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Datetime => "DATETIME",
            Self::Run => "RUN",
        }
    }
}

impl FromStr for WaitpointKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MANUAL" => Ok(Self::Manual),
            "DATETIME" => Ok(Self::Datetime),
            "RUN" => Ok(Self::Run),
            other => Err(EngineError::database(
                "decode_waitpoint_kind",
                format!("unknown waitpoint kind '{other}'"),
            )),
        }
    }
}

/// Completion state of a waitpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitpointStatus {
    /// Not completed yet.
    Pending,
    /// Completed; immutable from now on.
    Completed,
}

impl WaitpointStatus {
    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
        }
    }
}

/// Validity of a snapshot row.
///
/// Exactly one snapshot per run is `Valid`. Rows that were current once become
/// `Historical`; rows written by a transition that lost an optimistic race are
/// `Superseded` and never become current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotValidity {
    /// The run's current snapshot.
    Valid,
    /// Was current, replaced by a later transition.
    Historical,
    /// Written by a losing writer, kept for audit.
    Superseded,
}

impl SnapshotValidity {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Historical => "historical",
            Self::Superseded => "superseded",
        }
    }
}

impl FromStr for SnapshotValidity {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(Self::Valid),
            "historical" => Ok(Self::Historical),
            "superseded" => Ok(Self::Superseded),
            other => Err(EngineError::database(
                "decode_snapshot_validity",
                format!("unknown validity '{other}'"),
            )),
        }
    }
}

/// How a queue came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueKind {
    /// Declared explicitly by name.
    Named,
    /// Derived from a task identifier (`task/<id>`).
    Virtual,
}

impl QueueKind {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Named => "NAMED",
            Self::Virtual => "VIRTUAL",
        }
    }
}

/// Name of the queue derived from a task identifier.
pub fn task_queue_name(task_identifier: &str) -> String {
    format!("task/{}", task_identifier)
}

/// Generate a new internal identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate an externally exposed identifier with the given prefix.
pub fn friendly_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in ExecutionStatus::ALL {
            let parsed: ExecutionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("RUNNING".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<_> = ExecutionStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                &ExecutionStatus::Finished,
                &ExecutionStatus::Failed,
                &ExecutionStatus::Canceled
            ]
        );
        assert!(!ExecutionStatus::WaitingForDeploy.is_terminal());
    }

    #[test]
    fn test_status_serde_matches_db_representation() {
        let json = serde_json::to_string(&ExecutionStatus::ExecutingWithWaitpoints).unwrap();
        assert_eq!(json, "\"EXECUTING_WITH_WAITPOINTS\"");
    }

    #[test]
    fn test_friendly_ids() {
        let id = friendly_id("run");
        assert!(id.starts_with("run_"));
        assert_eq!(id.len(), "run_".len() + 32);
        assert_ne!(friendly_id("run"), id);
        assert_eq!(task_queue_name("email/send"), "task/email/send");
    }
}
