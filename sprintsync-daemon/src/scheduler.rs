//! Refresh scheduling.
//!
//! Each tick:
//! 1. registers every configured sprint with the tracker and skips closed
//!    sprints outside the retention window;
//! 2. returns retryable failures whose cooldown elapsed to `pending`;
//! 3. refreshes every due sprint on a bounded worker pool.
//!
//! One refresh takes the sprint's lease, fetches with a per-call timeout and
//! bounded retries for transient errors, then hands the result to
//! [`sprintsync_engine::apply_fetch`]. Shutdown cancels in-flight fetches and
//! returns their sprints to `pending`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, RwLock, Semaphore};
use tokio::task::JoinSet;

use sprintsync_core::types::{EntityKey, FailureKind, SnapshotId, SprintId, SyncStatus};
use sprintsync_core::{Config, RefreshSettings};
use sprintsync_engine::backoff::{cooldown_from_settings, Backoff, RetryPolicy};
use sprintsync_engine::{
    apply_fetch, Begin, EngineError, FetchError, IssueSource, Lease, RemoteSprint, SnapshotStore,
    SyncTracker,
};

use crate::error::DaemonError;

/// Durations derived from [`RefreshSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
    pub cooldown: Backoff,
    pub interval: chrono::Duration,
}

impl Timing {
    pub fn from_settings(settings: &RefreshSettings) -> Self {
        Self {
            fetch_timeout: settings.fetch_timeout(),
            retry: RetryPolicy::from_settings(settings),
            cooldown: cooldown_from_settings(settings),
            interval: chrono::Duration::from_std(settings.interval())
                .unwrap_or_else(|_| chrono::Duration::hours(6)),
        }
    }
}

/// Outcome of one sprint refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RefreshResult {
    Refreshed {
        sprint: SprintId,
        snapshot_id: SnapshotId,
        issue_count: usize,
        conflicts: usize,
        unchanged: bool,
        attempts: u32,
    },
    /// Another refresh of the sprint holds the lease.
    Busy { sprint: SprintId },
    Failed {
        sprint: SprintId,
        kind: FailureKind,
        error: String,
        attempts: u32,
    },
    Cancelled { sprint: SprintId },
}

impl RefreshResult {
    pub fn sprint(&self) -> &SprintId {
        match self {
            RefreshResult::Refreshed { sprint, .. }
            | RefreshResult::Busy { sprint }
            | RefreshResult::Failed { sprint, .. }
            | RefreshResult::Cancelled { sprint } => sprint,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    pub skipped: Vec<String>,
    pub requeued: Vec<String>,
    pub results: Vec<RefreshResult>,
}

struct Settings {
    config: Config,
    timing: Timing,
    source: Arc<dyn IssueSource>,
}

pub struct Scheduler {
    settings: RwLock<Settings>,
    store: Arc<dyn SnapshotStore>,
    tracker: Arc<SyncTracker>,
    workers: Arc<Semaphore>,
    shutdown: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
}

/// Level-triggered view of the shutdown broadcast. Latches once shutdown
/// is seen, so refreshes still queued for a worker observe it too.
struct StopSignal {
    rx: watch::Receiver<bool>,
    forward: tokio::task::JoinHandle<()>,
}

impl Drop for StopSignal {
    fn drop(&mut self) {
        self.forward.abort();
    }
}

/// Resolves once `stop` latches (or its forwarder is gone).
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Returns the lease to `pending` if a refresh is dropped mid-flight.
struct LeaseGuard {
    tracker: Arc<SyncTracker>,
    lease: Option<Lease>,
}

impl LeaseGuard {
    fn disarm(&mut self) -> Option<Lease> {
        self.lease.take()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            tracing::debug!(entity = %lease.key(), "releasing abandoned lease");
            self.tracker.cancel(lease, Utc::now());
        }
    }
}

impl Scheduler {
    pub fn new(
        config: Config,
        source: Arc<dyn IssueSource>,
        store: Arc<dyn SnapshotStore>,
        tracker: Arc<SyncTracker>,
        shutdown: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let timing = Timing::from_settings(&config.refresh);
        Self::with_timing(config, timing, source, store, tracker, shutdown)
    }

    pub fn with_timing(
        config: Config,
        timing: Timing,
        source: Arc<dyn IssueSource>,
        store: Arc<dyn SnapshotStore>,
        tracker: Arc<SyncTracker>,
        shutdown: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let workers = Arc::new(Semaphore::new(config.refresh.workers.max(1)));
        Arc::new(Self {
            settings: RwLock::new(Settings {
                config,
                timing,
                source,
            }),
            store,
            tracker,
            workers,
            shutdown,
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn tracker(&self) -> &Arc<SyncTracker> {
        &self.tracker
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub async fn config(&self) -> Config {
        self.settings.read().await.config.clone()
    }

    /// Swap in a reloaded config and source. Permanently failed sprints are
    /// reset so the new settings get a chance. The worker pool size is fixed
    /// at startup.
    pub async fn apply_config(&self, config: Config, source: Arc<dyn IssueSource>) -> Vec<EntityKey> {
        let mut settings = self.settings.write().await;
        settings.timing = Timing::from_settings(&config.refresh);
        settings.config = config;
        settings.source = source;
        drop(settings);
        self.tracker.reset_permanent(Utc::now())
    }

    /// One scheduling pass. Waits for every dispatched refresh.
    pub async fn tick(self: &Arc<Self>) -> TickSummary {
        let (config, timing) = {
            let settings = self.settings.read().await;
            (settings.config.clone(), settings.timing)
        };
        let now = Utc::now();
        let retention = config.refresh.retention();
        let mut summary = TickSummary::default();

        let mut keys = Vec::new();
        for entry in &config.sprints {
            let key = EntityKey::sprint(&entry.id);
            let state = self.tracker.observe(&key, now);
            if entry.outside_retention(now, retention) {
                if matches!(state.status, SyncStatus::Completed | SyncStatus::Failed) {
                    self.tracker.reset(&key, now);
                }
                if self
                    .tracker
                    .skip(&key, "closed sprint outside retention window", now)
                {
                    tracing::info!(sprint = %entry.id, "skipping closed sprint");
                    summary.skipped.push(entry.id.0.clone());
                }
                continue;
            }
            keys.push(key);
        }

        summary.requeued = self
            .tracker
            .requeue_failed(now, &timing.cooldown)
            .into_iter()
            .map(|key| key.id)
            .collect();

        let due: Vec<SprintId> = self
            .tracker
            .due(&keys, timing.interval, now)
            .into_iter()
            .map(|key| SprintId(key.id))
            .collect();
        if !due.is_empty() {
            tracing::debug!(count = due.len(), "dispatching due sprints");
        }
        summary.results = self.dispatch(due).await;
        summary
    }

    /// Refresh `sprint` (or every sprint inside the retention window) now,
    /// regardless of due time. Failed and skipped sprints are reset first.
    pub async fn refresh_now(
        self: &Arc<Self>,
        sprint: Option<SprintId>,
    ) -> Result<Vec<RefreshResult>, DaemonError> {
        let config = self.config().await;
        let now = Utc::now();
        let targets: Vec<SprintId> = match sprint {
            Some(id) => {
                if config.sprint(&id).is_none() {
                    return Err(DaemonError::UnknownSprint(id.0));
                }
                vec![id]
            }
            None => config
                .sprints
                .iter()
                .filter(|entry| !entry.outside_retention(now, config.refresh.retention()))
                .map(|entry| entry.id.clone())
                .collect(),
        };
        for id in &targets {
            self.tracker.reset(&EntityKey::sprint(id), now);
        }
        Ok(self.dispatch(targets).await)
    }

    /// Run refreshes on the worker pool; results are ordered by sprint id.
    async fn dispatch(self: &Arc<Self>, sprints: Vec<SprintId>) -> Vec<RefreshResult> {
        let signal = self.stop_signal();
        let mut set = JoinSet::new();
        for sprint in sprints {
            let this = Arc::clone(self);
            let mut stop = signal.rx.clone();
            set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = stopped(&mut stop) => None,
                    permit = this.workers.clone().acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    tracing::debug!(sprint = %sprint, "shutdown before a worker was free");
                    return RefreshResult::Cancelled { sprint };
                };
                this.refresh_leased(sprint, stop).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => tracing::error!(error = %err, "refresh task join failure"),
            }
        }
        results.sort_by(|a, b| a.sprint().cmp(b.sprint()));
        results
    }

    /// Subscribe to shutdown for one batch of refreshes. Starts latched when
    /// shutdown was already seen by an earlier batch.
    fn stop_signal(&self) -> StopSignal {
        let mut shutdown = self.shutdown.subscribe();
        let stopping = Arc::clone(&self.stopping);
        let (tx, rx) = watch::channel(stopping.load(Ordering::SeqCst));
        let forward = tokio::spawn(async move {
            let _ = shutdown.recv().await;
            stopping.store(true, Ordering::SeqCst);
            let _ = tx.send(true);
            tx.closed().await;
        });
        StopSignal { rx, forward }
    }

    /// One leased refresh of `sprint`.
    pub async fn refresh_sprint(&self, sprint: SprintId) -> RefreshResult {
        let signal = self.stop_signal();
        self.refresh_leased(sprint, signal.rx.clone()).await
    }

    async fn refresh_leased(
        &self,
        sprint: SprintId,
        mut stop: watch::Receiver<bool>,
    ) -> RefreshResult {
        let already_stopped = *stop.borrow();
        if already_stopped {
            return RefreshResult::Cancelled { sprint };
        }
        let (timing, source) = {
            let settings = self.settings.read().await;
            (settings.timing, Arc::clone(&settings.source))
        };

        let key = EntityKey::sprint(&sprint);
        let mut guard = match self.tracker.begin(&key, Utc::now()) {
            Begin::Acquired(lease) => LeaseGuard {
                tracker: Arc::clone(&self.tracker),
                lease: Some(lease),
            },
            Begin::Busy => {
                tracing::debug!(sprint = %sprint, "refresh already in flight");
                return RefreshResult::Busy { sprint };
            }
        };

        let started = Instant::now();
        let (fetched, attempts) = tokio::select! {
            out = fetch_with_retry(source, &sprint, timing) => out,
            _ = stopped(&mut stop) => {
                tracing::info!(sprint = %sprint, "refresh cancelled by shutdown");
                return RefreshResult::Cancelled { sprint: sprint.clone() };
            }
        };

        let Some(lease) = guard.disarm() else {
            return RefreshResult::Cancelled { sprint };
        };

        match fetched {
            Ok(remote) => {
                let ticket = lease.ticket();
                let store = Arc::clone(&self.store);
                let tracker = Arc::clone(&self.tracker);
                let applied = tokio::task::spawn_blocking(move || {
                    apply_fetch(store.as_ref(), &tracker, lease, remote, attempts, started)
                })
                .await;
                match applied {
                    Ok(Ok(outcome)) => RefreshResult::Refreshed {
                        sprint,
                        snapshot_id: outcome.snapshot_id,
                        issue_count: outcome.issue_count,
                        conflicts: outcome.conflicts,
                        unchanged: outcome.unchanged,
                        attempts,
                    },
                    Ok(Err(EngineError::LeaseLost { .. })) => {
                        tracing::warn!(sprint = %sprint, "lease taken over while persisting; result dropped");
                        RefreshResult::Busy { sprint }
                    }
                    Ok(Err(err)) => {
                        tracing::error!(sprint = %sprint, error = %err, "persisting refresh failed");
                        RefreshResult::Failed {
                            sprint,
                            kind: FailureKind::Storage,
                            error: err.to_string(),
                            attempts,
                        }
                    }
                    Err(err) => {
                        // The lease went down with the task; release it by ticket.
                        let error = format!("persist task failed: {err}");
                        tracing::error!(sprint = %sprint, error = %error, "persisting refresh failed");
                        self.tracker.fail_ticket(
                            &EntityKey::sprint(&sprint),
                            ticket,
                            FailureKind::Storage,
                            &error,
                            Utc::now(),
                        );
                        RefreshResult::Failed {
                            sprint,
                            kind: FailureKind::Storage,
                            error,
                            attempts,
                        }
                    }
                }
            }
            Err(err) => {
                let kind = err.failure_kind();
                let state = self.tracker.fail(lease, kind, &err.to_string(), Utc::now());
                tracing::warn!(
                    sprint = %sprint,
                    errors = state.error_count,
                    error = %err,
                    "refresh failed"
                );
                RefreshResult::Failed {
                    sprint,
                    kind,
                    error: err.to_string(),
                    attempts,
                }
            }
        }
    }
}

/// Call the blocking source with a per-call timeout, retrying transient
/// errors with backoff. Returns the final result and the number of calls.
async fn fetch_with_retry(
    source: Arc<dyn IssueSource>,
    sprint: &SprintId,
    timing: Timing,
) -> (Result<RemoteSprint, FetchError>, u32) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let call_source = Arc::clone(&source);
        let call_sprint = sprint.clone();
        let call =
            tokio::task::spawn_blocking(move || call_source.fetch_sprint_issues(&call_sprint));
        let result = match tokio::time::timeout(timing.fetch_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(FetchError::Transient(format!("fetch task failed: {err}"))),
            Err(_) => Err(FetchError::Transient(format!(
                "fetch timed out after {}ms",
                timing.fetch_timeout.as_millis()
            ))),
        };

        match result {
            Err(err) if err.is_transient() && timing.retry.allows_retry(attempt) => {
                let delay = timing.retry.backoff.delay(attempt);
                tracing::warn!(
                    sprint = %sprint,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient fetch failure; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return (other, attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use chrono::TimeZone;
    use sprintsync_core::types::{Issue, IssueKey, Priority, SprintState, SyncStatus};
    use sprintsync_core::SprintEntry;
    use sprintsync_engine::MemorySnapshotStore;

    /// Source that replays scripted results and counts calls.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Vec<Issue>, FetchError>>>,
        calls: Mutex<u32>,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<Issue>, FetchError>>) -> Arc<Self> {
            Self::slow(script, Duration::ZERO)
        }

        fn slow(script: Vec<Result<Vec<Issue>, FetchError>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
                delay,
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl IssueSource for ScriptedSource {
        fn fetch_sprint_issues(&self, sprint: &SprintId) -> Result<RemoteSprint, FetchError> {
            *self.calls.lock().unwrap() += 1;
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![]));
            next.map(|issues| RemoteSprint {
                sprint_id: sprint.clone(),
                state: SprintState::Active,
                issues,
            })
        }
    }

    /// Source that fails permanently for one sprint and serves the rest.
    struct OneBadSprint {
        bad: SprintId,
    }

    impl IssueSource for OneBadSprint {
        fn fetch_sprint_issues(&self, sprint: &SprintId) -> Result<RemoteSprint, FetchError> {
            if sprint == &self.bad {
                return Err(FetchError::Permanent("404 sprint not found".into()));
            }
            Ok(RemoteSprint {
                sprint_id: sprint.clone(),
                state: SprintState::Active,
                issues: vec![issue("A-1")],
            })
        }
    }

    /// Store whose capture panics.
    #[derive(Default)]
    struct PanickingStore {
        inner: MemorySnapshotStore,
    }

    impl SnapshotStore for PanickingStore {
        fn capture(
            &self,
            _sprint: &SprintId,
            _state: SprintState,
            _issues: Vec<Issue>,
            _captured_at: chrono::DateTime<Utc>,
        ) -> Result<SnapshotId, EngineError> {
            panic!("disk driver exploded");
        }

        fn latest(
            &self,
            sprint: &SprintId,
        ) -> Result<Option<sprintsync_core::types::SprintSnapshot>, EngineError> {
            self.inner.latest(sprint)
        }

        fn before(
            &self,
            sprint: &SprintId,
            at: chrono::DateTime<Utc>,
        ) -> Result<Option<sprintsync_core::types::SprintSnapshot>, EngineError> {
            self.inner.before(sprint, at)
        }

        fn history(
            &self,
            sprint: &SprintId,
        ) -> Result<Vec<sprintsync_engine::SnapshotMeta>, EngineError> {
            self.inner.history(sprint)
        }
    }

    fn issue(key: &str) -> Issue {
        Issue {
            key: IssueKey::from(key),
            title: key.to_string(),
            status: "To Do".into(),
            priority: Priority::Medium,
            story_points: Some(1.0),
            assignee: None,
            reporter: None,
            team: None,
            updated_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        }
    }

    fn config(sprints: &[&str]) -> Config {
        Config {
            sprints: sprints.iter().map(|id| SprintEntry::new(*id)).collect(),
            ..Config::default()
        }
    }

    fn fast_timing(fetch_timeout: Duration) -> Timing {
        Timing {
            fetch_timeout,
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
            },
            cooldown: Backoff::new(Duration::from_secs(300), Duration::from_secs(3600)),
            interval: chrono::Duration::hours(6),
        }
    }

    fn scheduler(
        config: Config,
        source: Arc<dyn IssueSource>,
        fetch_timeout: Duration,
    ) -> (Arc<Scheduler>, Arc<MemorySnapshotStore>, broadcast::Sender<()>) {
        let store = Arc::new(MemorySnapshotStore::new());
        let tracker = Arc::new(SyncTracker::in_memory(chrono::Duration::minutes(15)));
        let (shutdown, _) = broadcast::channel(4);
        let scheduler = Scheduler::with_timing(
            config,
            fast_timing(fetch_timeout),
            source,
            store.clone(),
            tracker,
            shutdown.clone(),
        );
        (scheduler, store, shutdown)
    }

    fn status(scheduler: &Scheduler, sprint: &str) -> SyncStatus {
        scheduler
            .tracker()
            .get(&EntityKey::sprint(&SprintId::from(sprint)))
            .expect("state")
            .status
    }

    #[tokio::test]
    async fn tick_refreshes_every_pending_sprint() {
        let source = ScriptedSource::new(vec![Ok(vec![issue("A-1")]), Ok(vec![issue("B-1")])]);
        let (scheduler, store, _shutdown) =
            scheduler(config(&["S-1", "S-2"]), source.clone(), Duration::from_secs(5));

        let summary = scheduler.tick().await;
        assert_eq!(summary.results.len(), 2);
        assert!(summary
            .results
            .iter()
            .all(|r| matches!(r, RefreshResult::Refreshed { .. })));
        assert_eq!(status(&scheduler, "S-1"), SyncStatus::Completed);
        assert!(store.latest(&SprintId::from("S-2")).unwrap().is_some());

        // Nothing is due on the next tick.
        let summary = scheduler.tick().await;
        assert!(summary.results.is_empty());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_within_one_cycle() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::Transient("503".into())),
            Err(FetchError::Transient("503".into())),
            Ok(vec![issue("A-1")]),
        ]);
        let (scheduler, _store, _shutdown) =
            scheduler(config(&["S-1"]), source.clone(), Duration::from_secs(5));

        let result = scheduler.refresh_sprint(SprintId::from("S-1")).await;
        assert!(
            matches!(result, RefreshResult::Refreshed { attempts: 3, .. }),
            "got: {result:?}"
        );
        let state = scheduler
            .tracker()
            .get(&EntityKey::sprint(&SprintId::from("S-1")))
            .unwrap();
        assert_eq!(state.api_calls, 3);
        assert_eq!(state.error_count, 0);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::Transient("503".into())),
            Err(FetchError::Transient("503".into())),
            Err(FetchError::Transient("503".into())),
            Ok(vec![]),
        ]);
        let (scheduler, _store, _shutdown) =
            scheduler(config(&["S-1"]), source.clone(), Duration::from_secs(5));

        let result = scheduler.refresh_sprint(SprintId::from("S-1")).await;
        assert!(matches!(
            result,
            RefreshResult::Failed {
                kind: FailureKind::Transient,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(source.calls(), 3);
        assert_eq!(status(&scheduler, "S-1"), SyncStatus::Failed);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried_or_requeued() {
        let source = ScriptedSource::new(vec![Err(FetchError::Permanent("401".into()))]);
        let (scheduler, _store, _shutdown) =
            scheduler(config(&["S-1"]), source.clone(), Duration::from_secs(5));

        let summary = scheduler.tick().await;
        assert!(matches!(
            summary.results[0],
            RefreshResult::Failed {
                kind: FailureKind::Permanent,
                attempts: 1,
                ..
            }
        ));
        assert_eq!(source.calls(), 1);

        let summary = scheduler.tick().await;
        assert!(summary.requeued.is_empty());
        assert!(summary.results.is_empty());
    }

    #[tokio::test]
    async fn slow_fetch_times_out_as_transient_failure() {
        let source = ScriptedSource::slow(vec![], Duration::from_millis(300));
        let (scheduler, _store, _shutdown) =
            scheduler(config(&["S-1"]), source, Duration::from_millis(20));

        let result = scheduler.refresh_sprint(SprintId::from("S-1")).await;
        match result {
            RefreshResult::Failed { kind, error, .. } => {
                assert_eq!(kind, FailureKind::Transient);
                assert!(error.contains("timed out"), "got: {error}");
            }
            other => panic!("expected timeout failure, got {other:?}"),
        }
        assert_eq!(status(&scheduler, "S-1"), SyncStatus::Failed);
    }

    #[tokio::test]
    async fn concurrent_refreshes_of_one_sprint_take_one_lease() {
        let source = ScriptedSource::slow(vec![], Duration::from_millis(100));
        let (scheduler, _store, _shutdown) =
            scheduler(config(&["S-1"]), source.clone(), Duration::from_secs(5));

        let (a, b) = tokio::join!(
            scheduler.refresh_sprint(SprintId::from("S-1")),
            scheduler.refresh_sprint(SprintId::from("S-1")),
        );
        let busy = [&a, &b]
            .iter()
            .filter(|r| matches!(r, RefreshResult::Busy { .. }))
            .count();
        assert_eq!(busy, 1, "got: {a:?} / {b:?}");
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_refresh() {
        let source = ScriptedSource::slow(vec![], Duration::from_millis(500));
        let (scheduler, store, shutdown) =
            scheduler(config(&["S-1"]), source, Duration::from_secs(5));

        let running = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.refresh_sprint(SprintId::from("S-1")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(()).expect("receiver alive");

        let result = running.await.expect("join");
        assert!(matches!(result, RefreshResult::Cancelled { .. }));
        assert_eq!(status(&scheduler, "S-1"), SyncStatus::Pending);
        assert!(store.latest(&SprintId::from("S-1")).unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_sprints_outside_retention_are_skipped() {
        let mut cfg = config(&["S-1", "S-OLD"]);
        cfg.sprints[1].state = SprintState::Closed;
        cfg.sprints[1].ended_at = Some(Utc::now() - chrono::Duration::days(90));
        let source = ScriptedSource::new(vec![]);
        let (scheduler, _store, _shutdown) = scheduler(cfg, source.clone(), Duration::from_secs(5));

        let summary = scheduler.tick().await;
        assert_eq!(summary.skipped, vec!["S-OLD".to_string()]);
        assert_eq!(summary.results.len(), 1);
        assert_eq!(status(&scheduler, "S-OLD"), SyncStatus::Skipped);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn manual_refresh_resets_permanent_failure() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::Permanent("403".into())),
            Ok(vec![issue("A-1")]),
        ]);
        let (scheduler, _store, _shutdown) =
            scheduler(config(&["S-1"]), source, Duration::from_secs(5));

        scheduler.tick().await;
        assert_eq!(status(&scheduler, "S-1"), SyncStatus::Failed);

        let results = scheduler
            .refresh_now(Some(SprintId::from("S-1")))
            .await
            .expect("refresh");
        assert!(matches!(results[0], RefreshResult::Refreshed { .. }));
    }

    #[tokio::test]
    async fn manual_refresh_of_unknown_sprint_is_rejected() {
        let (scheduler, _store, _shutdown) =
            scheduler(config(&["S-1"]), ScriptedSource::new(vec![]), Duration::from_secs(5));
        let err = scheduler
            .refresh_now(Some(SprintId::from("nope")))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::UnknownSprint(id) if id == "nope"));
    }

    #[tokio::test]
    async fn config_reload_resets_permanent_failures() {
        let (scheduler, _store, _shutdown) = scheduler(
            config(&["S-1"]),
            ScriptedSource::new(vec![Err(FetchError::Permanent("401".into()))]),
            Duration::from_secs(5),
        );
        scheduler.tick().await;

        let reset = scheduler
            .apply_config(config(&["S-1"]), ScriptedSource::new(vec![]))
            .await;
        assert_eq!(reset, vec![EntityKey::sprint(&SprintId::from("S-1"))]);
        assert_eq!(status(&scheduler, "S-1"), SyncStatus::Pending);
    }

    #[tokio::test]
    async fn shutdown_cancels_refreshes_still_waiting_for_a_worker() {
        let mut cfg = config(&["S-1", "S-2"]);
        cfg.refresh.workers = 1;
        let source = ScriptedSource::slow(vec![], Duration::from_millis(400));
        let (scheduler, store, shutdown) = scheduler(cfg, source.clone(), Duration::from_secs(5));

        let ticking = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.tick().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.send(()).expect("receiver alive");
        let sent = Instant::now();

        let summary = ticking.await.expect("join");
        assert!(
            sent.elapsed() < Duration::from_millis(300),
            "tick drained {:?} after shutdown",
            sent.elapsed()
        );
        assert_eq!(summary.results.len(), 2);
        assert!(
            summary
                .results
                .iter()
                .all(|r| matches!(r, RefreshResult::Cancelled { .. })),
            "got: {:?}",
            summary.results
        );
        assert_eq!(source.calls(), 1);
        for sprint in ["S-1", "S-2"] {
            assert_eq!(status(&scheduler, sprint), SyncStatus::Pending);
            assert!(store.latest(&SprintId::from(sprint)).unwrap().is_none());
        }

        // Later batches see the shutdown too.
        let result = scheduler.refresh_sprint(SprintId::from("S-1")).await;
        assert!(matches!(result, RefreshResult::Cancelled { .. }));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn one_failing_sprint_does_not_affect_the_others() {
        let source = Arc::new(OneBadSprint {
            bad: SprintId::from("S-BAD"),
        });
        let (scheduler, store, _shutdown) = scheduler(
            config(&["S-1", "S-BAD", "S-2"]),
            source,
            Duration::from_secs(5),
        );

        let summary = scheduler.tick().await;
        assert_eq!(summary.results.len(), 3);
        assert!(matches!(
            summary.results.iter().find(|r| r.sprint().0 == "S-BAD"),
            Some(RefreshResult::Failed {
                kind: FailureKind::Permanent,
                ..
            })
        ));
        assert_eq!(status(&scheduler, "S-BAD"), SyncStatus::Failed);
        for sprint in ["S-1", "S-2"] {
            assert_eq!(status(&scheduler, sprint), SyncStatus::Completed);
            assert!(store.latest(&SprintId::from(sprint)).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn panicking_persist_marks_storage_failure_and_frees_lease() {
        let store = Arc::new(PanickingStore::default());
        let tracker = Arc::new(SyncTracker::in_memory(chrono::Duration::minutes(15)));
        let (shutdown, _) = broadcast::channel(4);
        let scheduler = Scheduler::with_timing(
            config(&["S-1"]),
            fast_timing(Duration::from_secs(5)),
            ScriptedSource::new(vec![Ok(vec![issue("A-1")])]),
            store,
            tracker,
            shutdown,
        );

        let result = scheduler.refresh_sprint(SprintId::from("S-1")).await;
        assert!(
            matches!(
                result,
                RefreshResult::Failed {
                    kind: FailureKind::Storage,
                    ..
                }
            ),
            "got: {result:?}"
        );
        assert_eq!(status(&scheduler, "S-1"), SyncStatus::Failed);

        // The lease is free again, so the next attempt is not `Busy`.
        let again = scheduler.refresh_sprint(SprintId::from("S-1")).await;
        assert!(!matches!(again, RefreshResult::Busy { .. }), "got: {again:?}");
    }

    #[tokio::test]
    async fn completed_sprint_closing_outside_retention_is_skipped() {
        let source = ScriptedSource::new(vec![Ok(vec![issue("A-1")])]);
        let (scheduler, _store, _shutdown) =
            scheduler(config(&["S-1"]), source.clone(), Duration::from_secs(5));
        scheduler.tick().await;
        assert_eq!(status(&scheduler, "S-1"), SyncStatus::Completed);

        let mut closed = config(&["S-1"]);
        closed.sprints[0].state = SprintState::Closed;
        closed.sprints[0].ended_at = Some(Utc::now() - chrono::Duration::days(90));
        scheduler.apply_config(closed, source.clone()).await;

        let summary = scheduler.tick().await;
        assert_eq!(summary.skipped, vec!["S-1".to_string()]);
        assert!(summary.results.is_empty());
        assert_eq!(status(&scheduler, "S-1"), SyncStatus::Skipped);

        // Already skipped: not reported again.
        let summary = scheduler.tick().await;
        assert!(summary.skipped.is_empty());
        assert_eq!(source.calls(), 1);
    }
}
