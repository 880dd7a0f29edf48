// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Legal run status transitions.
//!
//! ```text
//!  RUN_CREATED ──► QUEUED ──► PENDING_EXECUTING ──► EXECUTING ◄──► EXECUTING_WITH_WAITPOINTS
//!       │            ▲               │                  │                  │
//!       ▼            │               │ lease expired    │                  ▼
//!  WAITING_FOR_DEPLOY┘◄──────────────┴──────────────────┘              SUSPENDED ──► QUEUED
//! ```
//!
//! Every non-terminal status may move to FAILED or CANCELED. FINISHED is only
//! reachable while an attempt is executing. Terminal statuses accept nothing.

use crate::error::{EngineError, Result};
use crate::types::ExecutionStatus;

/// Whether `from -> to` is a legal transition.
pub fn can_transition(from: ExecutionStatus, to: ExecutionStatus) -> bool {
    use ExecutionStatus::*;

    if from.is_terminal() {
        return false;
    }

    match to {
        Failed | Canceled => true,
        Finished => matches!(from, Executing | ExecutingWithWaitpoints),
        Queued => matches!(
            from,
            RunCreated
                | WaitingForDeploy
                | PendingExecuting
                | Executing
                | ExecutingWithWaitpoints
                | Suspended
        ),
        WaitingForDeploy => from == RunCreated,
        PendingExecuting => from == Queued,
        Executing => matches!(from, PendingExecuting | ExecutingWithWaitpoints),
        ExecutingWithWaitpoints => from == Executing,
        Suspended => from == ExecutingWithWaitpoints,
        RunCreated => false,
    }
}

/// Check a transition, producing the error a caller should see when it is refused.
pub fn ensure_transition(run_id: &str, from: ExecutionStatus, to: ExecutionStatus) -> Result<()> {
    if from.is_terminal() {
        return Err(EngineError::RunTerminal {
            run_id: run_id.to_string(),
            status: from.to_string(),
        });
    }
    if !can_transition(from, to) {
        return Err(EngineError::InvalidTransition {
            run_id: run_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}
