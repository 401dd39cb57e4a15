use std::sync::Arc;

use chrono::Utc;
use sprintsync_core::config::{add_sprint_at, init_at};
use sprintsync_core::types::{Issue, IssueKey, Priority, SprintId, SprintState, SyncStatus};
use sprintsync_core::SprintEntry;
use sprintsync_daemon::{collect_status_at, RefreshResult, Scheduler};
use sprintsync_engine::{
    FetchError, FileSnapshotStore, FreshnessSignal, IssueSource, RemoteSprint, SyncTracker,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

struct FixedSource;

impl IssueSource for FixedSource {
    fn fetch_sprint_issues(&self, sprint: &SprintId) -> Result<RemoteSprint, FetchError> {
        if sprint.0 == "BROKEN" {
            return Err(FetchError::Permanent("HTTP 404".into()));
        }
        Ok(RemoteSprint {
            sprint_id: sprint.clone(),
            state: SprintState::Active,
            issues: vec![Issue {
                key: IssueKey::from("PAY-1"),
                title: "Checkout flow".into(),
                status: "In Progress".into(),
                priority: Priority::High,
                story_points: Some(5.0),
                assignee: Some("ana".into()),
                reporter: None,
                team: None,
                updated_at: Utc::now(),
            }],
        })
    }
}

#[tokio::test]
async fn refresh_results_survive_in_files() {
    let home = TempDir::new().expect("home");
    init_at(home.path(), None).expect("init");
    add_sprint_at(home.path(), SprintEntry::new("PAY-S12")).expect("add sprint");
    let config = add_sprint_at(home.path(), SprintEntry::new("BROKEN")).expect("add sprint");

    let tracker = SyncTracker::open_at(home.path(), chrono::Duration::minutes(15)).expect("tracker");
    let (shutdown, _) = broadcast::channel(1);
    let scheduler = Scheduler::new(
        config,
        Arc::new(FixedSource),
        Arc::new(FileSnapshotStore::open_at(home.path())),
        Arc::new(tracker),
        shutdown,
    );

    let summary = scheduler.tick().await;
    assert_eq!(summary.results.len(), 2);
    assert!(matches!(summary.results[0], RefreshResult::Failed { .. }));
    assert!(matches!(summary.results[1], RefreshResult::Refreshed { .. }));
    drop(scheduler);

    // A fresh reader sees the same picture from disk.
    let rows = collect_status_at(home.path()).expect("status");
    let pay = rows.iter().find(|r| r.sprint == "PAY-S12").expect("PAY-S12 row");
    assert_eq!(pay.status, SyncStatus::Completed);
    assert_eq!(pay.snapshots, 1);
    assert_eq!(pay.story_points, 5.0);

    let broken = rows.iter().find(|r| r.sprint == "BROKEN").expect("BROKEN row");
    assert_eq!(broken.status, SyncStatus::Failed);
    assert!(matches!(broken.signal, FreshnessSignal::Failing { errors: 1, .. }));
}
