use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Duration, TimeZone, Utc};
use sprintsync_core::types::{
    EntityKey, FailureKind, Issue, IssueKey, Priority, SnapshotId, SprintId, SprintSnapshot,
    SprintState, SyncStatus,
};
use sprintsync_engine::{
    apply_fetch, compare,
    freshness::{self, FreshnessSignal},
    snapshot_store::SnapshotMeta,
    Begin, EngineError, FileSnapshotStore, Lease, MemorySnapshotStore, RemoteSprint,
    SnapshotStore, SyncTracker,
};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn issue(key: &str, status: &str, points: f64, updated_at: DateTime<Utc>) -> Issue {
    Issue {
        key: IssueKey::from(key),
        title: format!("{key} title"),
        status: status.into(),
        priority: Priority::Medium,
        story_points: Some(points),
        assignee: None,
        reporter: None,
        team: None,
        updated_at,
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

fn remote(sprint: &str, issues: Vec<Issue>) -> RemoteSprint {
    RemoteSprint {
        sprint_id: SprintId::from(sprint),
        state: SprintState::Active,
        issues,
    }
}

fn lease(tracker: &SyncTracker, sprint: &str) -> Lease {
    match tracker.begin(&EntityKey::sprint(&SprintId::from(sprint)), Utc::now()) {
        Begin::Acquired(lease) => lease,
        Begin::Busy => panic!("lease for {sprint} is busy"),
    }
}

/// Store whose writes fail on demand.
#[derive(Default)]
struct FlakyStore {
    inner: MemorySnapshotStore,
    fail_writes: AtomicBool,
}

impl SnapshotStore for FlakyStore {
    fn capture(
        &self,
        sprint: &SprintId,
        state: SprintState,
        issues: Vec<Issue>,
        captured_at: DateTime<Utc>,
    ) -> Result<SnapshotId, EngineError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::Storage {
                path: "/dev/full".into(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.inner.capture(sprint, state, issues, captured_at)
    }

    fn latest(&self, sprint: &SprintId) -> Result<Option<SprintSnapshot>, EngineError> {
        self.inner.latest(sprint)
    }

    fn before(
        &self,
        sprint: &SprintId,
        at: DateTime<Utc>,
    ) -> Result<Option<SprintSnapshot>, EngineError> {
        self.inner.before(sprint, at)
    }

    fn history(&self, sprint: &SprintId) -> Result<Vec<SnapshotMeta>, EngineError> {
        self.inner.history(sprint)
    }
}

#[test]
fn successful_fetch_is_captured_and_completed() {
    init_logging();
    let home = TempDir::new().expect("home");
    let store = FileSnapshotStore::open_at(home.path());
    let tracker = SyncTracker::open_at(home.path(), Duration::minutes(15)).expect("tracker");

    let outcome = apply_fetch(
        &store,
        &tracker,
        lease(&tracker, "PAY-S12"),
        remote("PAY-S12", vec![issue("PAY-1", "To Do", 3.0, t0())]),
        1,
        Instant::now(),
    )
    .expect("refresh");

    assert_eq!(outcome.issue_count, 1);
    assert_eq!(outcome.conflicts, 0);
    assert!(!outcome.unchanged);
    assert_eq!(outcome.state.status, SyncStatus::Completed);
    assert_eq!(outcome.state.api_calls, 1);

    let latest = store
        .latest(&SprintId::from("PAY-S12"))
        .expect("latest")
        .expect("snapshot present");
    assert_eq!(latest.id, outcome.snapshot_id);
}

#[test]
fn unreadable_baseline_does_not_block_capture() {
    init_logging();
    let home = TempDir::new().expect("home");
    let store = FileSnapshotStore::open_at(home.path());
    let tracker = SyncTracker::in_memory(Duration::minutes(15));
    let dir = store.root().join("PAY-S12");
    std::fs::create_dir_all(&dir).expect("sprint dir");
    std::fs::write(dir.join("0000000000001-000.json"), "not json").expect("corrupt file");

    for _ in 0..2 {
        let outcome = apply_fetch(
            &store,
            &tracker,
            lease(&tracker, "PAY-S12"),
            remote("PAY-S12", vec![issue("PAY-1", "To Do", 3.0, t0())]),
            1,
            Instant::now(),
        )
        .expect("refresh despite corrupt baseline");
        assert_eq!(outcome.state.status, SyncStatus::Completed);
    }

    let latest = store
        .latest(&SprintId::from("PAY-S12"))
        .expect("newest snapshot readable")
        .expect("snapshot captured");
    assert_eq!(latest.issues.len(), 1);
    let files = std::fs::read_dir(&dir).expect("list").count();
    assert_eq!(files, 3);
}

#[test]
fn second_identical_fetch_is_flagged_unchanged() {
    let store = MemorySnapshotStore::new();
    let tracker = SyncTracker::in_memory(Duration::minutes(15));
    let issues = vec![issue("PAY-1", "To Do", 3.0, t0())];

    let refresh = || {
        apply_fetch(
            &store,
            &tracker,
            lease(&tracker, "PAY-S12"),
            remote("PAY-S12", issues.clone()),
            1,
            Instant::now(),
        )
        .expect("refresh")
    };
    assert!(!refresh().unchanged);
    assert!(refresh().unchanged);
    assert_eq!(store.history(&SprintId::from("PAY-S12")).unwrap().len(), 2);
}

#[test]
fn stale_remote_copy_is_recorded_as_conflict_and_remote_wins() {
    let store = MemorySnapshotStore::new();
    let tracker = SyncTracker::in_memory(Duration::minutes(15));

    apply_fetch(
        &store,
        &tracker,
        lease(&tracker, "S-1"),
        remote("S-1", vec![issue("A-1", "In Progress", 3.0, t0())]),
        1,
        Instant::now(),
    )
    .expect("first refresh");

    // Same updated_at, different status: the tracker served an older copy.
    let outcome = apply_fetch(
        &store,
        &tracker,
        lease(&tracker, "S-1"),
        remote("S-1", vec![issue("A-1", "To Do", 3.0, t0())]),
        1,
        Instant::now(),
    )
    .expect("second refresh");

    assert_eq!(outcome.conflicts, 1);
    let state = tracker
        .get(&EntityKey::sprint(&SprintId::from("S-1")))
        .expect("state");
    let record = state.conflicts.expect("conflict record");
    assert_eq!(record.conflicts[0].issue, IssueKey::from("A-1"));

    let latest = store.latest(&SprintId::from("S-1")).unwrap().unwrap();
    assert_eq!(latest.issues[0].status, "To Do");
}

#[test]
fn storage_failure_marks_sprint_failed() {
    init_logging();
    let store = FlakyStore::default();
    store.fail_writes.store(true, Ordering::SeqCst);
    let tracker = SyncTracker::in_memory(Duration::minutes(15));

    let err = apply_fetch(
        &store,
        &tracker,
        lease(&tracker, "S-1"),
        remote("S-1", vec![issue("A-1", "To Do", 1.0, t0())]),
        1,
        Instant::now(),
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::Storage { .. }));

    let state = tracker
        .get(&EntityKey::sprint(&SprintId::from("S-1")))
        .expect("state");
    assert_eq!(state.status, SyncStatus::Failed);
    assert_eq!(state.failure, Some(FailureKind::Storage));
    assert_eq!(state.error_count, 1);
    assert!(store.latest(&SprintId::from("S-1")).unwrap().is_none());
}

#[test]
fn compare_latest_against_earlier_capture() {
    let home = TempDir::new().expect("home");
    let store = FileSnapshotStore::open_at(home.path());
    let sprint = SprintId::from("PAY-S12");

    store
        .capture(
            &sprint,
            SprintState::Active,
            vec![
                issue("PAY-1", "To Do", 3.0, t0()),
                issue("PAY-2", "To Do", 5.0, t0()),
            ],
            t0(),
        )
        .unwrap();
    store
        .capture(
            &sprint,
            SprintState::Active,
            vec![
                issue("PAY-1", "Done", 3.0, t0() + Duration::hours(2)),
                issue("PAY-3", "To Do", 2.0, t0() + Duration::hours(2)),
            ],
            t0() + Duration::hours(3),
        )
        .unwrap();

    let newer = store.latest(&sprint).unwrap().unwrap();
    let older = store.before(&sprint, newer.captured_at).unwrap().unwrap();
    let result = compare(&older, &newer).expect("compare");

    assert_eq!(result.added.len(), 1);
    assert_eq!(result.removed.len(), 1);
    assert_eq!(result.changed.len(), 1);
    assert_eq!(result.changed[0].changes[0].field_name(), "status");
    assert_eq!(result.story_point_delta(), -3.0);
}

#[test]
fn freshness_follows_refresh_lifecycle() {
    let store = MemorySnapshotStore::new();
    let tracker = SyncTracker::in_memory(Duration::minutes(15));
    let sprint = SprintId::from("S-1");
    let key = EntityKey::sprint(&sprint);
    let interval = Duration::hours(6);

    assert_eq!(
        freshness::check(tracker.get(&key).as_ref(), None, interval, Utc::now()),
        FreshnessSignal::NoData
    );

    let running = lease(&tracker, "S-1");
    assert_eq!(
        freshness::check(tracker.get(&key).as_ref(), None, interval, Utc::now()),
        FreshnessSignal::Refreshing
    );

    apply_fetch(
        &store,
        &tracker,
        running,
        remote("S-1", vec![]),
        1,
        Instant::now(),
    )
    .expect("refresh");
    let latest = store.history(&sprint).unwrap().pop();
    let signal = freshness::check(tracker.get(&key).as_ref(), latest.as_ref(), interval, Utc::now());
    assert_eq!(signal.label(), "current");
}
