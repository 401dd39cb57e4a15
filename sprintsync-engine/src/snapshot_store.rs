//! Append-only snapshot log.
//!
//! Each capture is one JSON document under
//! `<home>/.sprintsync/snapshots/<sprint>/<millis>-<seq>.json`.
//! Writes go to a dot-prefixed `.tmp` file that is renamed into place, so a
//! reader sees a complete snapshot or none. Existing files are never
//! overwritten; a second capture in the same millisecond bumps `seq`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use sprintsync_core::types::{Issue, SnapshotId, SprintId, SprintSnapshot, SprintState};

use crate::error::{storage_err, EngineError};

/// Summary of a stored snapshot, without its issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: SnapshotId,
    pub sprint_id: SprintId,
    pub state: SprintState,
    pub captured_at: DateTime<Utc>,
    pub issue_count: usize,
    pub story_points: f64,
    /// SHA-256 over the serialized issue list; equal digests mean equal issues.
    pub digest: String,
}

impl SnapshotMeta {
    pub fn of(snapshot: &SprintSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            sprint_id: snapshot.sprint_id.clone(),
            state: snapshot.state,
            captured_at: snapshot.captured_at,
            issue_count: snapshot.issues.len(),
            story_points: snapshot.total_points(),
            digest: digest_issues(&snapshot.issues),
        }
    }
}

/// Append-only storage of sprint snapshots.
///
/// Implementations must be safe to share between refresh workers.
pub trait SnapshotStore: Send + Sync {
    /// Persist a new snapshot and return its identifier.
    fn capture(
        &self,
        sprint: &SprintId,
        state: SprintState,
        issues: Vec<Issue>,
        captured_at: DateTime<Utc>,
    ) -> Result<SnapshotId, EngineError>;

    /// Most recent snapshot for `sprint`.
    fn latest(&self, sprint: &SprintId) -> Result<Option<SprintSnapshot>, EngineError>;

    /// Most recent snapshot captured strictly before `at`.
    fn before(
        &self,
        sprint: &SprintId,
        at: DateTime<Utc>,
    ) -> Result<Option<SprintSnapshot>, EngineError>;

    /// All snapshots for `sprint`, oldest first.
    fn history(&self, sprint: &SprintId) -> Result<Vec<SnapshotMeta>, EngineError>;
}

/// Hex SHA-256 of the issue list as stored.
pub fn digest_issues(issues: &[Issue]) -> String {
    let json = serde_json::to_vec(issues).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&json);
    hex::encode(hasher.finalize())
}

fn snapshot_id(sprint: &SprintId, millis: i64, seq: u32) -> SnapshotId {
    SnapshotId(format!("{sprint}@{millis}-{seq}"))
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// Snapshot store rooted at `<home>/.sprintsync/snapshots`.
#[derive(Debug)]
pub struct FileSnapshotStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

/// `<home>/.sprintsync/snapshots`: pure, no I/O.
pub fn snapshots_dir_at(home: &Path) -> PathBuf {
    sprintsync_core::config::root_at(home).join("snapshots")
}

impl FileSnapshotStore {
    pub fn open_at(home: &Path) -> Self {
        Self::with_root(snapshots_dir_at(home))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self {
            root,
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sprint_dir(&self, sprint: &SprintId) -> PathBuf {
        self.root.join(dir_name(sprint))
    }

    /// Snapshot files for `sprint` ordered by `(millis, seq)`.
    fn entries(&self, sprint: &SprintId) -> Result<Vec<(i64, u32, PathBuf)>, EngineError> {
        let dir = self.sprint_dir(sprint);
        let read = match std::fs::read_dir(&dir) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(storage_err(&dir, err)),
        };
        let mut entries = Vec::new();
        for entry in read {
            let entry = entry.map_err(|e| storage_err(&dir, e))?;
            let name = entry.file_name();
            let Some((millis, seq)) = parse_file_name(&name.to_string_lossy()) else {
                continue;
            };
            entries.push((millis, seq, entry.path()));
        }
        entries.sort_by_key(|(millis, seq, _)| (*millis, *seq));
        Ok(entries)
    }

    fn read_snapshot(path: &Path) -> Result<SprintSnapshot, EngineError> {
        let contents = std::fs::read_to_string(path).map_err(|e| storage_err(path, e))?;
        serde_json::from_str(&contents).map_err(|source| EngineError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read entries newest first and return the first that belongs to
    /// `sprint` and satisfies `accept`.
    fn newest_matching(
        &self,
        sprint: &SprintId,
        accept: impl Fn(&SprintSnapshot) -> bool,
    ) -> Result<Option<SprintSnapshot>, EngineError> {
        for (_, _, path) in self.entries(sprint)?.into_iter().rev() {
            let snapshot = Self::read_snapshot(&path)?;
            // Sanitized directory names may be shared by distinct sprint ids.
            if &snapshot.sprint_id == sprint && accept(&snapshot) {
                return Ok(Some(snapshot));
            }
        }
        Ok(None)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn capture(
        &self,
        sprint: &SprintId,
        state: SprintState,
        issues: Vec<Issue>,
        captured_at: DateTime<Utc>,
    ) -> Result<SnapshotId, EngineError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let dir = self.sprint_dir(sprint);
        std::fs::create_dir_all(&dir).map_err(|e| storage_err(&dir, e))?;

        let millis = captured_at.timestamp_millis();
        let mut seq = 0u32;
        let mut path = dir.join(file_name(millis, seq));
        while path.exists() {
            seq += 1;
            path = dir.join(file_name(millis, seq));
        }

        let id = snapshot_id(sprint, millis, seq);
        let snapshot = SprintSnapshot {
            id: id.clone(),
            sprint_id: sprint.clone(),
            state,
            captured_at,
            issues,
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        let tmp = dir.join(format!(".{}.tmp", file_name(millis, seq)));
        std::fs::write(&tmp, json).map_err(|e| storage_err(&tmp, e))?;
        if let Err(err) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(storage_err(&path, err));
        }
        tracing::debug!(
            "captured snapshot {id} ({} issues) at {}",
            snapshot.issues.len(),
            path.display()
        );
        Ok(id)
    }

    fn latest(&self, sprint: &SprintId) -> Result<Option<SprintSnapshot>, EngineError> {
        self.newest_matching(sprint, |_| true)
    }

    fn before(
        &self,
        sprint: &SprintId,
        at: DateTime<Utc>,
    ) -> Result<Option<SprintSnapshot>, EngineError> {
        self.newest_matching(sprint, |snapshot| snapshot.captured_at < at)
    }

    fn history(&self, sprint: &SprintId) -> Result<Vec<SnapshotMeta>, EngineError> {
        let mut metas = Vec::new();
        for (_, _, path) in self.entries(sprint)? {
            let snapshot = Self::read_snapshot(&path)?;
            if &snapshot.sprint_id == sprint {
                metas.push(SnapshotMeta::of(&snapshot));
            }
        }
        Ok(metas)
    }
}

fn file_name(millis: i64, seq: u32) -> String {
    format!("{millis:013}-{seq:03}.json")
}

/// Parse `<millis>-<seq>.json`. Temp files and strays yield `None`.
fn parse_file_name(name: &str) -> Option<(i64, u32)> {
    let stem = name.strip_suffix(".json")?;
    let (millis, seq) = stem.split_once('-')?;
    Some((millis.parse().ok()?, seq.parse().ok()?))
}

/// Filesystem-safe directory name for a sprint id.
fn dir_name(sprint: &SprintId) -> String {
    let name: String = sprint
        .0
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        format!("_{name}")
    } else {
        name
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store; used by tests and one-shot runs without a home dir.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<HashMap<SprintId, Vec<SprintSnapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut HashMap<SprintId, Vec<SprintSnapshot>>) -> T) -> T {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn capture(
        &self,
        sprint: &SprintId,
        state: SprintState,
        issues: Vec<Issue>,
        captured_at: DateTime<Utc>,
    ) -> Result<SnapshotId, EngineError> {
        Ok(self.with_log(|log| {
            let snapshots = log.entry(sprint.clone()).or_default();
            let millis = captured_at.timestamp_millis();
            let seq = snapshots
                .iter()
                .filter(|s| s.captured_at.timestamp_millis() == millis)
                .count() as u32;
            let id = snapshot_id(sprint, millis, seq);
            let snapshot = SprintSnapshot {
                id: id.clone(),
                sprint_id: sprint.clone(),
                state,
                captured_at,
                issues,
            };
            let at = snapshots.partition_point(|s| s.captured_at <= captured_at);
            snapshots.insert(at, snapshot);
            id
        }))
    }

    fn latest(&self, sprint: &SprintId) -> Result<Option<SprintSnapshot>, EngineError> {
        Ok(self.with_log(|log| log.get(sprint).and_then(|s| s.last().cloned())))
    }

    fn before(
        &self,
        sprint: &SprintId,
        at: DateTime<Utc>,
    ) -> Result<Option<SprintSnapshot>, EngineError> {
        Ok(self.with_log(|log| {
            log.get(sprint)
                .and_then(|s| s.iter().rev().find(|snap| snap.captured_at < at).cloned())
        }))
    }

    fn history(&self, sprint: &SprintId) -> Result<Vec<SnapshotMeta>, EngineError> {
        Ok(self.with_log(|log| {
            log.get(sprint)
                .map(|s| s.iter().map(SnapshotMeta::of).collect())
                .unwrap_or_default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use sprintsync_core::types::{IssueKey, Priority};
    use tempfile::TempDir;

    fn issue(key: &str, points: f64) -> Issue {
        Issue {
            key: IssueKey::from(key),
            title: format!("{key} title"),
            status: "To Do".into(),
            priority: Priority::Medium,
            story_points: Some(points),
            assignee: None,
            reporter: None,
            team: None,
            updated_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn latest_is_none_for_unknown_sprint() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::open_at(tmp.path());
        assert!(store.latest(&SprintId::from("S-1")).unwrap().is_none());
        assert!(store.history(&SprintId::from("S-1")).unwrap().is_empty());
    }

    #[test]
    fn capture_then_latest_returns_snapshot() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::open_at(tmp.path());
        let sprint = SprintId::from("S-1");
        let id = store
            .capture(&sprint, SprintState::Active, vec![issue("A-1", 3.0)], t0())
            .unwrap();

        let latest = store.latest(&sprint).unwrap().expect("snapshot");
        assert_eq!(latest.id, id);
        assert_eq!(latest.issues.len(), 1);
        assert_eq!(latest.captured_at, t0());
    }

    #[test]
    fn same_millisecond_captures_do_not_overwrite() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::open_at(tmp.path());
        let sprint = SprintId::from("S-1");
        let first = store
            .capture(&sprint, SprintState::Active, vec![issue("A-1", 1.0)], t0())
            .unwrap();
        let second = store
            .capture(&sprint, SprintState::Active, vec![issue("A-2", 2.0)], t0())
            .unwrap();

        assert_ne!(first, second);
        let history = store.history(&sprint).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, first);
        assert_eq!(history[1].id, second);
        assert_eq!(store.latest(&sprint).unwrap().unwrap().id, second);
    }

    #[test]
    fn before_is_strict() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::open_at(tmp.path());
        let sprint = SprintId::from("S-1");
        let early = store
            .capture(&sprint, SprintState::Active, vec![], t0())
            .unwrap();
        store
            .capture(&sprint, SprintState::Active, vec![], t0() + Duration::hours(1))
            .unwrap();

        let found = store
            .before(&sprint, t0() + Duration::hours(1))
            .unwrap()
            .expect("earlier snapshot");
        assert_eq!(found.id, early);
        assert!(store.before(&sprint, t0()).unwrap().is_none());
    }

    #[test]
    fn temp_files_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::open_at(tmp.path());
        let sprint = SprintId::from("S-1");
        let dir = store.root().join("S-1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(".0000000000001-000.json.tmp"), "{partial").unwrap();

        assert!(store.latest(&sprint).unwrap().is_none());
    }

    #[test]
    fn unsafe_sprint_ids_are_sanitized_and_kept_apart() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::open_at(tmp.path());
        let slashed = SprintId::from("team/a");
        let underscored = SprintId::from("team_a");
        store
            .capture(&slashed, SprintState::Active, vec![issue("A-1", 1.0)], t0())
            .unwrap();

        assert!(store.root().join("team_a").is_dir());
        assert!(store.latest(&underscored).unwrap().is_none());
        assert!(store.latest(&slashed).unwrap().is_some());
        assert_eq!(dir_name(&SprintId::from("..")), "_..");
    }

    #[test]
    fn corrupt_file_is_reported_with_path() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::open_at(tmp.path());
        let dir = store.root().join("S-1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("0000000000001-000.json"), "not json").unwrap();

        let err = store.latest(&SprintId::from("S-1")).unwrap_err();
        assert!(matches!(err, EngineError::Corrupt { .. }), "got: {err:?}");
    }

    #[test]
    fn memory_store_orders_by_capture_time() {
        let store = MemorySnapshotStore::new();
        let sprint = SprintId::from("S-1");
        let late = store
            .capture(&sprint, SprintState::Active, vec![], t0() + Duration::hours(2))
            .unwrap();
        let early = store
            .capture(&sprint, SprintState::Active, vec![], t0())
            .unwrap();

        assert_eq!(store.latest(&sprint).unwrap().unwrap().id, late);
        assert_eq!(
            store.before(&sprint, t0() + Duration::hours(1)).unwrap().unwrap().id,
            early
        );
        let ids: Vec<_> = store
            .history(&sprint)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![early, late]);
    }

    #[test]
    fn meta_digest_tracks_issue_content() {
        let a = vec![issue("A-1", 1.0)];
        let b = vec![issue("A-1", 2.0)];
        assert_eq!(digest_issues(&a), digest_issues(&a.clone()));
        assert_ne!(digest_issues(&a), digest_issues(&b));
    }
}
