//! Persist the result of a successful fetch.
//!
//! Pipeline for one leased sprint:
//! 1. Compare the remote issues against the latest snapshot and record any
//!    conflicts (`remote_wins`). An unreadable latest snapshot is treated as
//!    no baseline.
//! 2. Capture the remote issues as a new snapshot.
//! 3. Complete the lease.
//!
//! A capture failure marks the sprint `failed` with `FailureKind::Storage`
//! and is returned to the caller.

use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use sprintsync_core::types::{FailureKind, ResolutionStrategy, SnapshotId, SyncState};

use crate::conflict::detect_conflicts;
use crate::error::EngineError;
use crate::snapshot_store::{digest_issues, SnapshotStore};
use crate::source::RemoteSprint;
use crate::tracker::{Lease, SyncTracker};

/// What one refresh produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshOutcome {
    pub snapshot_id: SnapshotId,
    pub issue_count: usize,
    pub conflicts: usize,
    /// Issue list identical to the previous snapshot.
    pub unchanged: bool,
    pub state: SyncState,
}

pub fn apply_fetch(
    store: &dyn SnapshotStore,
    tracker: &SyncTracker,
    lease: Lease,
    remote: RemoteSprint,
    api_calls: u32,
    started: Instant,
) -> Result<RefreshOutcome, EngineError> {
    let key = lease.key().clone();

    // The baseline only feeds conflict detection. An unreadable one must not
    // block the capture that would replace it.
    let previous = match store.latest(&remote.sprint_id) {
        Ok(previous) => previous,
        Err(err) => {
            tracing::warn!("{key}: latest snapshot unreadable, skipping conflict check: {err}");
            None
        }
    };

    let conflicts = previous
        .as_ref()
        .map(|local| detect_conflicts(local, &remote.issues))
        .unwrap_or_default();
    if !conflicts.is_empty() {
        tracing::warn!(
            "{key}: {} conflicting issue(s); keeping remote copy",
            conflicts.len()
        );
    }
    let conflict_count = conflicts.len();
    tracker.record_conflicts(&key, conflicts, ResolutionStrategy::RemoteWins, Utc::now());

    let unchanged = previous
        .as_ref()
        .is_some_and(|local| digest_issues(&local.issues) == digest_issues(&remote.issues));
    let issue_count = remote.issues.len();

    let snapshot_id =
        match store.capture(&remote.sprint_id, remote.state, remote.issues, Utc::now()) {
            Ok(id) => id,
            Err(err) => {
                tracing::error!("{key}: snapshot capture failed: {err}");
                tracker.fail(lease, FailureKind::Storage, &err.to_string(), Utc::now());
                return Err(err);
            }
        };

    let duration_ms = started.elapsed().as_millis() as u64;
    let state = tracker.complete(lease, duration_ms, api_calls, Utc::now())?;
    tracing::info!("{key}: captured {snapshot_id} ({issue_count} issues, {duration_ms}ms)");

    Ok(RefreshOutcome {
        snapshot_id,
        issue_count,
        conflicts: conflict_count,
        unchanged,
        state,
    })
}
