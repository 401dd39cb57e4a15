//! Sync state tracker.
//!
//! One [`SyncState`] per entity, keyed by `(kind, id)`. State records are
//! never deleted. At most one refresh per entity is in flight: [`SyncTracker::begin`]
//! hands out an exclusive [`Lease`] or reports [`Begin::Busy`].
//!
//! Transitions:
//!
//! ```text
//! pending ──begin──▶ in_progress ──complete──▶ completed ──(due)──▶ in_progress
//!    ▲                   │  │
//!    │                   │  └──fail──▶ failed ──requeue (retryable, cooled down)──▶ pending
//!    │                   └──cancel──▶ pending
//!    └──reset── failed / completed / skipped
//! pending ──skip──▶ skipped
//! ```
//!
//! When opened with a home directory the tracker mirrors its map to
//! `<home>/.sprintsync/state/sync_state.json` after every mutation. Records
//! found `in_progress` at load time belonged to a dead process and are reset
//! to `pending`.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use sprintsync_core::types::{
    ConflictRecord, EntityKey, FailureKind, IssueConflict, ResolutionStrategy, SyncState,
    SyncStatus,
};

use crate::backoff::Backoff;
use crate::error::{storage_err, EngineError};

/// Exclusive right to refresh one entity. Consumed by `complete`, `fail` or
/// `cancel`.
#[derive(Debug)]
pub struct Lease {
    key: EntityKey,
    token: u64,
    acquired_at: DateTime<Utc>,
}

/// Identity of a lease that outlives the lease itself, so a caller that
/// hands the lease to code which may unwind can still release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTicket(u64);

impl Lease {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn ticket(&self) -> LeaseTicket {
        LeaseTicket(self.token)
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

/// Result of [`SyncTracker::begin`].
#[derive(Debug)]
pub enum Begin {
    Acquired(Lease),
    /// Another refresh of the same entity holds a live lease.
    Busy,
}

#[derive(Debug, Clone, Copy)]
struct Held {
    token: u64,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    states: BTreeMap<EntityKey, SyncState>,
    leases: HashMap<EntityKey, Held>,
    next_token: u64,
}

/// On-disk tracker payload.
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    saved_at: DateTime<Utc>,
    #[serde(default)]
    states: Vec<SyncState>,
}

/// `<home>/.sprintsync/state/sync_state.json`: pure, no I/O.
pub fn state_path_at(home: &Path) -> PathBuf {
    sprintsync_core::config::root_at(home)
        .join("state")
        .join("sync_state.json")
}

#[derive(Debug)]
pub struct SyncTracker {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
    lease_ttl: Duration,
}

impl SyncTracker {
    /// Tracker without persistence.
    pub fn in_memory(lease_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            path: None,
            lease_ttl,
        }
    }

    /// Load the persisted state document (or start empty) and persist to it
    /// from now on.
    pub fn open_at(home: &Path, lease_ttl: Duration) -> Result<Self, EngineError> {
        let path = state_path_at(home);
        let mut inner = Inner::default();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let file: StateFile =
                    serde_json::from_str(&contents).map_err(|source| EngineError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                for mut state in file.states {
                    if state.status == SyncStatus::InProgress {
                        tracing::warn!("{} was in progress at shutdown; resetting to pending", state.key);
                        state.status = SyncStatus::Pending;
                    }
                    inner.states.insert(state.key.clone(), state);
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(storage_err(&path, err)),
        }
        Ok(Self {
            inner: Mutex::new(inner),
            path: Some(path),
            lease_ttl,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write the state map to disk. Failures are logged, never propagated:
    /// the in-memory map stays authoritative for this process.
    fn persist(&self, inner: &Inner) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(err) = write_state_file(path, inner) {
            tracing::warn!("failed to persist sync state: {err}");
        }
    }

    /// Current record for `key`, creating a `pending` one if absent.
    pub fn observe(&self, key: &EntityKey, now: DateTime<Utc>) -> SyncState {
        let mut inner = self.lock();
        if let Some(state) = inner.states.get(key) {
            return state.clone();
        }
        let state = SyncState::new(key.clone(), now);
        inner.states.insert(key.clone(), state.clone());
        self.persist(&inner);
        state
    }

    pub fn get(&self, key: &EntityKey) -> Option<SyncState> {
        self.lock().states.get(key).cloned()
    }

    /// All records ordered by key.
    pub fn all(&self) -> Vec<SyncState> {
        self.lock().states.values().cloned().collect()
    }

    /// Try to take the refresh lease for `key`.
    ///
    /// A lease older than the configured TTL is considered abandoned and is
    /// taken over; its holder's later `complete` fails with `LeaseLost`.
    pub fn begin(&self, key: &EntityKey, now: DateTime<Utc>) -> Begin {
        let mut inner = self.lock();
        if let Some(held) = inner.leases.get(key) {
            if now - held.acquired_at < self.lease_ttl {
                return Begin::Busy;
            }
            tracing::warn!(
                "lease on {key} held since {} exceeded its TTL; taking over",
                held.acquired_at
            );
        }

        inner.next_token += 1;
        let token = inner.next_token;
        inner.leases.insert(
            key.clone(),
            Held {
                token,
                acquired_at: now,
            },
        );
        let state = inner
            .states
            .entry(key.clone())
            .or_insert_with(|| SyncState::new(key.clone(), now));
        state.status = SyncStatus::InProgress;
        state.last_attempt_at = Some(now);
        state.skip_reason = None;
        state.updated_at = now;
        self.persist(&inner);

        Begin::Acquired(Lease {
            key: key.clone(),
            token,
            acquired_at: now,
        })
    }

    /// Release `lease` if it is still the current one.
    fn release(inner: &mut Inner, lease: &Lease) -> bool {
        Self::release_ticket(inner, &lease.key, lease.ticket())
    }

    fn release_ticket(inner: &mut Inner, key: &EntityKey, ticket: LeaseTicket) -> bool {
        match inner.leases.get(key) {
            Some(held) if held.token == ticket.0 => {
                inner.leases.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Mark the leased entity `completed` and reset its error count.
    pub fn complete(
        &self,
        lease: Lease,
        duration_ms: u64,
        api_calls: u32,
        now: DateTime<Utc>,
    ) -> Result<SyncState, EngineError> {
        let mut inner = self.lock();
        if !Self::release(&mut inner, &lease) {
            return Err(EngineError::LeaseLost { key: lease.key });
        }
        let state = inner
            .states
            .entry(lease.key.clone())
            .or_insert_with(|| SyncState::new(lease.key.clone(), now));
        state.status = SyncStatus::Completed;
        state.last_success_at = Some(now);
        state.error_count = 0;
        state.last_error = None;
        state.failure = None;
        state.duration_ms = Some(duration_ms);
        state.api_calls = api_calls;
        state.updated_at = now;
        let state = state.clone();
        self.persist(&inner);
        Ok(state)
    }

    /// Mark the leased entity `failed`. Never errors: a lost lease is logged
    /// and the current record returned unchanged.
    pub fn fail(
        &self,
        lease: Lease,
        kind: FailureKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> SyncState {
        self.fail_ticket(&lease.key, lease.ticket(), kind, message, now)
    }

    /// [`fail`](Self::fail) for a lease that was lost to an unwinding task.
    pub fn fail_ticket(
        &self,
        key: &EntityKey,
        ticket: LeaseTicket,
        kind: FailureKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> SyncState {
        let mut inner = self.lock();
        let released = Self::release_ticket(&mut inner, key, ticket);
        let state = inner
            .states
            .entry(key.clone())
            .or_insert_with(|| SyncState::new(key.clone(), now));
        if !released {
            tracing::warn!("dropping failure for {key}: lease no longer held ({message})");
            return state.clone();
        }
        state.status = SyncStatus::Failed;
        state.error_count = state.error_count.saturating_add(1);
        state.last_error = Some(message.to_string());
        state.failure = Some(kind);
        state.updated_at = now;
        let state = state.clone();
        self.persist(&inner);
        state
    }

    /// Give the lease back without recording a result; the entity returns to
    /// `pending`.
    pub fn cancel(&self, lease: Lease, now: DateTime<Utc>) {
        self.abandon(&lease.key, lease.ticket(), now);
    }

    /// [`cancel`](Self::cancel) for a lease that was lost to an unwinding
    /// task. No-op once the lease was completed, failed or taken over.
    pub fn abandon(&self, key: &EntityKey, ticket: LeaseTicket, now: DateTime<Utc>) {
        let mut inner = self.lock();
        if !Self::release_ticket(&mut inner, key, ticket) {
            return;
        }
        if let Some(state) = inner.states.get_mut(key) {
            if state.status == SyncStatus::InProgress {
                state.status = SyncStatus::Pending;
                state.updated_at = now;
            }
        }
        self.persist(&inner);
    }

    /// Attach detected conflicts and the applied strategy to `key`'s record.
    /// An empty list clears any previous record.
    pub fn record_conflicts(
        &self,
        key: &EntityKey,
        conflicts: Vec<IssueConflict>,
        strategy: ResolutionStrategy,
        now: DateTime<Utc>,
    ) {
        let mut inner = self.lock();
        let state = inner
            .states
            .entry(key.clone())
            .or_insert_with(|| SyncState::new(key.clone(), now));
        state.conflicts = if conflicts.is_empty() {
            None
        } else {
            Some(ConflictRecord {
                detected_at: now,
                strategy,
                conflicts,
            })
        };
        state.updated_at = now;
        self.persist(&inner);
    }

    /// Move a `pending` entity to `skipped`. Returns false in any other status.
    pub fn skip(&self, key: &EntityKey, reason: &str, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        let state = inner
            .states
            .entry(key.clone())
            .or_insert_with(|| SyncState::new(key.clone(), now));
        if state.status != SyncStatus::Pending {
            return false;
        }
        state.status = SyncStatus::Skipped;
        state.skip_reason = Some(reason.to_string());
        state.updated_at = now;
        self.persist(&inner);
        true
    }

    /// Return retryable failures whose cooldown has elapsed to `pending`.
    ///
    /// The cooldown after `n` consecutive errors is `cooldown.delay(n)`,
    /// measured from the last attempt.
    pub fn requeue_failed(&self, now: DateTime<Utc>, cooldown: &Backoff) -> Vec<EntityKey> {
        let mut inner = self.lock();
        let mut requeued = Vec::new();
        for state in inner.states.values_mut() {
            if state.status != SyncStatus::Failed {
                continue;
            }
            if !state.failure.is_some_and(FailureKind::is_retryable) {
                continue;
            }
            let wait = Duration::from_std(cooldown.delay(state.error_count))
                .unwrap_or_else(|_| Duration::days(36_500));
            let since = state.last_attempt_at.unwrap_or(state.updated_at);
            if now - since < wait {
                continue;
            }
            state.status = SyncStatus::Pending;
            state.updated_at = now;
            requeued.push(state.key.clone());
        }
        if !requeued.is_empty() {
            self.persist(&inner);
        }
        requeued
    }

    /// Return a non-running entity to `pending`. The error count and last
    /// error stay for audit until the next success. Returns false if the
    /// entity is unknown or in progress.
    pub fn reset(&self, key: &EntityKey, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        let Some(state) = inner.states.get_mut(key) else {
            return false;
        };
        if state.status == SyncStatus::InProgress {
            return false;
        }
        reset_state(state, now);
        self.persist(&inner);
        true
    }

    /// Reset every permanently failed entity. Used after a config change.
    pub fn reset_permanent(&self, now: DateTime<Utc>) -> Vec<EntityKey> {
        let mut inner = self.lock();
        let mut reset = Vec::new();
        for state in inner.states.values_mut() {
            if state.status == SyncStatus::Failed && state.failure == Some(FailureKind::Permanent) {
                reset_state(state, now);
                reset.push(state.key.clone());
            }
        }
        if !reset.is_empty() {
            self.persist(&inner);
        }
        reset
    }

    /// Entities among `keys` due for a refresh: `pending`, or `completed`
    /// with the last attempt more than `interval` ago.
    pub fn due(&self, keys: &[EntityKey], interval: Duration, now: DateTime<Utc>) -> Vec<EntityKey> {
        let inner = self.lock();
        keys.iter()
            .filter(|key| match inner.states.get(*key) {
                None => true,
                Some(state) => is_due(state, interval, now),
            })
            .cloned()
            .collect()
    }
}

/// Due test for a single record.
pub fn is_due(state: &SyncState, interval: Duration, now: DateTime<Utc>) -> bool {
    match state.status {
        SyncStatus::Pending => true,
        SyncStatus::Completed => state
            .last_attempt_at
            .map_or(true, |last| now - last > interval),
        SyncStatus::InProgress | SyncStatus::Failed | SyncStatus::Skipped => false,
    }
}

fn reset_state(state: &mut SyncState, now: DateTime<Utc>) {
    state.status = SyncStatus::Pending;
    state.failure = None;
    state.skip_reason = None;
    state.updated_at = now;
}

fn write_state_file(path: &Path, inner: &Inner) -> Result<(), EngineError> {
    let Some(dir) = path.parent() else {
        return Err(storage_err(
            path,
            std::io::Error::other("invalid sync state path"),
        ));
    };
    std::fs::create_dir_all(dir).map_err(|e| storage_err(dir, e))?;

    let file = StateFile {
        saved_at: Utc::now(),
        states: inner.states.values().cloned().collect(),
    };
    let json = serde_json::to_string_pretty(&file)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| storage_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| storage_err(path, e))?;
    Ok(())
}
