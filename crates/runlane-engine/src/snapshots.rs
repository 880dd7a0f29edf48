// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reads over the execution snapshot log.
//!
//! "Changes since" returns every snapshot after the given one with waitpoint
//! detail only on the last entry, so a long history of large waitpoint outputs
//! is never loaded at once.

use tracing::{debug, instrument};

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::persistence::{SnapshotRecord, WaitpointRecord};

/// A snapshot together with the waitpoints it carries.
#[derive(Debug, Clone)]
pub struct SnapshotView {
    pub snapshot: SnapshotRecord,
    /// Empty for every entry of a "changes since" result except the last.
    pub waitpoints: Vec<WaitpointRecord>,
}

impl Engine {
    /// Snapshots written after `from_snapshot_id`, oldest first.
    ///
    /// Returns `Ok(None)` when the snapshot does not exist or belongs to
    /// another run. Superseded snapshots are left out.
    #[instrument(skip(self))]
    pub async fn get_snapshots_since(
        &self,
        run_id: &str,
        from_snapshot_id: &str,
    ) -> Result<Option<Vec<SnapshotView>>> {
        let Some(from) = self.persistence.get_snapshot(from_snapshot_id).await? else {
            return Ok(None);
        };
        if from.run_id != run_id {
            return Ok(None);
        }

        let snapshots = self
            .persistence
            .list_snapshots_after(run_id, from.seq)
            .await?;
        let count = snapshots.len();

        let mut views = Vec::with_capacity(count);
        for (idx, snapshot) in snapshots.into_iter().enumerate() {
            let waitpoints = if idx + 1 == count {
                self.load_snapshot_waitpoints(&snapshot.id).await?
            } else {
                Vec::new()
            };
            views.push(SnapshotView {
                snapshot,
                waitpoints,
            });
        }

        debug!(run_id = %run_id, snapshots = views.len(), "loaded snapshots since");
        Ok(Some(views))
    }

    /// The run's current snapshot with its waitpoints.
    #[instrument(skip(self))]
    pub async fn get_latest_snapshot(&self, run_id: &str) -> Result<SnapshotView> {
        let snapshot = self
            .persistence
            .get_latest_snapshot(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        let waitpoints = self.load_snapshot_waitpoints(&snapshot.id).await?;
        Ok(SnapshotView {
            snapshot,
            waitpoints,
        })
    }

    /// Every snapshot of the run, superseded ones included.
    pub async fn list_snapshots(&self, run_id: &str) -> Result<Vec<SnapshotRecord>> {
        self.get_run(run_id).await?;
        self.persistence.list_snapshots(run_id).await
    }

    /// Waitpoints attached to a snapshot, fetched `waitpoint_chunk_size` at a time.
    pub(crate) async fn load_snapshot_waitpoints(
        &self,
        snapshot_id: &str,
    ) -> Result<Vec<WaitpointRecord>> {
        let ids = self
            .persistence
            .list_snapshot_waitpoint_ids(snapshot_id)
            .await?;

        let mut waitpoints = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.config.waitpoint_chunk_size.max(1)) {
            waitpoints.extend(self.persistence.get_waitpoints_by_ids(chunk).await?);
        }
        Ok(waitpoints)
    }
}
