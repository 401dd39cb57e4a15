//! Snapshot comparison.
//!
//! Diffs two snapshots of the same sprint by issue key: issues only in the
//! newer one are added, issues only in the older one are removed, issues in
//! both with a tracked field difference are changed. Title and reporter
//! edits are not tracked.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sprintsync_core::types::{
    FieldChange, Issue, IssueKey, SnapshotId, SprintId, SprintSnapshot,
};

use crate::error::EngineError;

/// Totals for one side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub snapshot_id: SnapshotId,
    pub captured_at: DateTime<Utc>,
    pub issue_count: usize,
    pub story_points: f64,
    /// Issue count per status.
    pub status_histogram: BTreeMap<String, usize>,
}

impl SnapshotSummary {
    pub fn of(snapshot: &SprintSnapshot) -> Self {
        let mut status_histogram = BTreeMap::new();
        for issue in &snapshot.issues {
            *status_histogram.entry(issue.status.clone()).or_insert(0) += 1;
        }
        Self {
            snapshot_id: snapshot.id.clone(),
            captured_at: snapshot.captured_at,
            issue_count: snapshot.issues.len(),
            story_points: snapshot.total_points(),
            status_histogram,
        }
    }
}

/// Tracked field changes of one issue present in both snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueChange {
    pub key: IssueKey,
    pub title: String,
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub sprint_id: SprintId,
    pub older: SnapshotSummary,
    pub newer: SnapshotSummary,
    /// In the newer snapshot's order.
    pub added: Vec<Issue>,
    /// In the older snapshot's order.
    pub removed: Vec<Issue>,
    /// In the newer snapshot's order.
    pub changed: Vec<IssueChange>,
    /// Issues present in both with no tracked difference.
    pub unchanged: usize,
    /// Story-point change relative to the older total, in percent.
    /// `None` when the older snapshot has zero points.
    pub story_point_delta_pct: Option<f64>,
}

impl ComparisonResult {
    /// No added, removed or changed issues.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn story_point_delta(&self) -> f64 {
        self.newer.story_points - self.older.story_points
    }
}

/// Compare `older` against `newer`.
///
/// Fails with `InvalidComparison` when the snapshots belong to different
/// sprints. Comparing a snapshot with itself yields an empty result.
pub fn compare(
    older: &SprintSnapshot,
    newer: &SprintSnapshot,
) -> Result<ComparisonResult, EngineError> {
    if older.sprint_id != newer.sprint_id {
        return Err(EngineError::InvalidComparison {
            older: older.sprint_id.clone(),
            newer: newer.sprint_id.clone(),
        });
    }

    let old_by_key = index(&older.issues);
    let new_by_key = index(&newer.issues);

    let mut added = Vec::new();
    let mut changed = Vec::new();
    let mut unchanged = 0;
    let mut seen = HashSet::new();
    for issue in &newer.issues {
        if !seen.insert(&issue.key) {
            continue;
        }
        match old_by_key.get(&issue.key) {
            None => added.push(issue.clone()),
            Some(before) => {
                let changes = before.field_changes(issue);
                if changes.is_empty() {
                    unchanged += 1;
                } else {
                    changed.push(IssueChange {
                        key: issue.key.clone(),
                        title: issue.title.clone(),
                        changes,
                    });
                }
            }
        }
    }

    let mut seen = HashSet::new();
    let removed: Vec<Issue> = older
        .issues
        .iter()
        .filter(|issue| seen.insert(&issue.key) && !new_by_key.contains_key(&issue.key))
        .cloned()
        .collect();

    let older_summary = SnapshotSummary::of(older);
    let newer_summary = SnapshotSummary::of(newer);
    let story_point_delta_pct = if older_summary.story_points == 0.0 {
        None
    } else {
        Some(
            (newer_summary.story_points - older_summary.story_points) / older_summary.story_points
                * 100.0,
        )
    };

    Ok(ComparisonResult {
        sprint_id: newer.sprint_id.clone(),
        older: older_summary,
        newer: newer_summary,
        added,
        removed,
        changed,
        unchanged,
        story_point_delta_pct,
    })
}

/// Key → issue; the first occurrence wins.
fn index(issues: &[Issue]) -> HashMap<&IssueKey, &Issue> {
    let mut map = HashMap::with_capacity(issues.len());
    for issue in issues {
        map.entry(&issue.key).or_insert(issue);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sprintsync_core::types::{Priority, SprintState};

    fn issue(key: &str, status: &str, points: Option<f64>) -> Issue {
        Issue {
            key: IssueKey::from(key),
            title: format!("{key} title"),
            status: status.into(),
            priority: Priority::Medium,
            story_points: points,
            assignee: None,
            reporter: None,
            team: None,
            updated_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        }
    }

    fn snapshot(sprint: &str, hour: u32, issues: Vec<Issue>) -> SprintSnapshot {
        let captured_at = Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap();
        SprintSnapshot {
            id: SnapshotId(format!("{sprint}@{}-0", captured_at.timestamp_millis())),
            sprint_id: SprintId::from(sprint),
            state: SprintState::Active,
            captured_at,
            issues,
        }
    }

    #[test]
    fn classifies_added_removed_changed() {
        let older = snapshot(
            "S-1",
            9,
            vec![
                issue("A-1", "To Do", Some(3.0)),
                issue("A-2", "To Do", Some(5.0)),
                issue("A-3", "Done", Some(2.0)),
            ],
        );
        let newer = snapshot(
            "S-1",
            12,
            vec![
                issue("A-1", "In Progress", Some(3.0)),
                issue("A-3", "Done", Some(2.0)),
                issue("A-4", "To Do", Some(8.0)),
            ],
        );

        let result = compare(&older, &newer).unwrap();
        let keys = |issues: &[Issue]| issues.iter().map(|i| i.key.0.clone()).collect::<Vec<_>>();
        assert_eq!(keys(&result.added), vec!["A-4"]);
        assert_eq!(keys(&result.removed), vec!["A-2"]);
        assert_eq!(result.changed.len(), 1);
        assert_eq!(result.changed[0].key, IssueKey::from("A-1"));
        assert_eq!(result.unchanged, 1);
        assert_eq!(result.older.story_points, 10.0);
        assert_eq!(result.newer.story_points, 13.0);
        assert_eq!(result.story_point_delta(), 3.0);
        let pct = result.story_point_delta_pct.expect("pct");
        assert!((pct - 30.0).abs() < 1e-9);
        assert_eq!(result.newer.status_histogram.get("To Do"), Some(&1));
        assert_eq!(result.newer.status_histogram.get("In Progress"), Some(&1));
    }

    #[test]
    fn comparing_snapshot_with_itself_is_empty() {
        let snap = snapshot("S-1", 9, vec![issue("A-1", "To Do", Some(1.0))]);
        let result = compare(&snap, &snap).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.unchanged, 1);
        assert_eq!(result.story_point_delta_pct, Some(0.0));
    }

    #[test]
    fn one_empty_side_puts_every_issue_in_added_or_removed() {
        let empty = snapshot("S-1", 9, vec![]);
        let full = snapshot(
            "S-1",
            12,
            vec![issue("A-1", "To Do", Some(3.0)), issue("A-2", "Done", None)],
        );

        let grown = compare(&empty, &full).unwrap();
        assert_eq!(grown.added.len(), 2);
        assert!(grown.removed.is_empty());
        assert!(grown.changed.is_empty());
        assert_eq!(grown.unchanged, 0);
        assert_eq!(grown.older.story_points, 0.0);
        assert_eq!(grown.story_point_delta_pct, None);

        let emptied = compare(&full, &empty).unwrap();
        assert!(emptied.added.is_empty());
        assert_eq!(emptied.removed.len(), 2);
        assert!(emptied.changed.is_empty());
        assert_eq!(emptied.unchanged, 0);
        assert_eq!(emptied.newer.issue_count, 0);
        assert_eq!(emptied.story_point_delta_pct, Some(-100.0));
    }

    #[test]
    fn different_sprints_are_rejected() {
        let a = snapshot("S-1", 9, vec![]);
        let b = snapshot("S-2", 10, vec![]);
        let err = compare(&a, &b).unwrap_err();
        assert!(matches!(err, EngineError::InvalidComparison { .. }));
    }

    #[test]
    fn zero_point_baseline_has_no_percentage() {
        let older = snapshot("S-1", 9, vec![issue("A-1", "To Do", None)]);
        let newer = snapshot("S-1", 10, vec![issue("A-1", "To Do", Some(5.0))]);
        let result = compare(&older, &newer).unwrap();
        assert_eq!(result.story_point_delta_pct, None);
        assert_eq!(result.story_point_delta(), 5.0);
        assert_eq!(result.changed.len(), 1);
    }

    #[test]
    fn title_edits_are_not_changes() {
        let older = snapshot("S-1", 9, vec![issue("A-1", "To Do", Some(1.0))]);
        let mut renamed = issue("A-1", "To Do", Some(1.0));
        renamed.title = "Renamed".into();
        let newer = snapshot("S-1", 10, vec![renamed]);
        assert!(compare(&older, &newer).unwrap().is_empty());
    }
}
