use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sprintsync_core::types::{EntityKey, SnapshotId, SprintState, SyncStatus};
use sprintsync_core::Config;
use sprintsync_engine::freshness::{self, FreshnessSignal};
use sprintsync_engine::{FileSnapshotStore, SnapshotStore, SyncTracker};

use crate::error::DaemonError;

/// Per-sprint row of `sprintsync status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SprintStatus {
    pub sprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub state: SprintState,
    pub status: SyncStatus,
    pub signal: FreshnessSignal,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub conflicts: usize,
    pub snapshots: usize,
    pub latest_snapshot: Option<SnapshotId>,
    pub issue_count: usize,
    pub story_points: f64,
}

/// Status of every configured sprint, in config order. Read-only: sprints
/// the tracker has not seen yet are reported as `pending`.
pub fn collect_status(
    config: &Config,
    tracker: &SyncTracker,
    store: &dyn SnapshotStore,
    now: DateTime<Utc>,
) -> Result<Vec<SprintStatus>, DaemonError> {
    let interval = chrono::Duration::from_std(config.refresh.interval())
        .unwrap_or_else(|_| chrono::Duration::hours(6));

    let mut rows = Vec::with_capacity(config.sprints.len());
    for entry in &config.sprints {
        let state = tracker.get(&EntityKey::sprint(&entry.id));
        let history = store.history(&entry.id)?;
        let latest = history.last();
        let signal = freshness::check(state.as_ref(), latest, interval, now);

        rows.push(SprintStatus {
            sprint: entry.id.0.clone(),
            name: entry.name.clone(),
            state: latest.map_or(entry.state, |meta| meta.state),
            status: state.as_ref().map_or(SyncStatus::Pending, |s| s.status),
            signal,
            last_success_at: state.as_ref().and_then(|s| s.last_success_at),
            last_attempt_at: state.as_ref().and_then(|s| s.last_attempt_at),
            error_count: state.as_ref().map_or(0, |s| s.error_count),
            last_error: state.as_ref().and_then(|s| s.last_error.clone()),
            conflicts: state
                .as_ref()
                .and_then(|s| s.conflicts.as_ref())
                .map_or(0, |record| record.conflicts.len()),
            snapshots: history.len(),
            latest_snapshot: latest.map(|meta| meta.id.clone()),
            issue_count: latest.map_or(0, |meta| meta.issue_count),
            story_points: latest.map_or(0.0, |meta| meta.story_points),
        });
    }
    Ok(rows)
}

/// [`collect_status`] straight from the files under `home`, for when no
/// daemon is running.
pub fn collect_status_at(home: &Path) -> Result<Vec<SprintStatus>, DaemonError> {
    let config = sprintsync_core::config::load_at(home)?;
    let lease_ttl = chrono::Duration::from_std(config.refresh.lease_ttl())
        .unwrap_or_else(|_| chrono::Duration::minutes(15));
    let tracker = SyncTracker::open_at(home, lease_ttl)?;
    let store = FileSnapshotStore::open_at(home);
    collect_status(&config, &tracker, &store, Utc::now())
}
