//! Detect divergence between the last captured snapshot and a fresh remote
//! read.
//!
//! An issue conflicts when it exists on both sides, at least one tracked
//! field differs, and the remote `updated_at` is not newer than the local
//! one. A remote edit with a newer timestamp is an ordinary update.
//!
//! Detected conflicts are recorded on the sprint's sync state. The remote
//! copy is always the one captured (`remote_wins`).

use std::collections::HashMap;

use sprintsync_core::types::{FieldConflict, Issue, IssueConflict, IssueKey, SprintSnapshot};

pub fn detect_conflicts(local: &SprintSnapshot, remote: &[Issue]) -> Vec<IssueConflict> {
    let by_key: HashMap<&IssueKey, &Issue> =
        local.issues.iter().map(|issue| (&issue.key, issue)).collect();

    let mut conflicts: Vec<IssueConflict> = remote
        .iter()
        .filter_map(|theirs| {
            let ours = by_key.get(&theirs.key)?;
            if theirs.updated_at > ours.updated_at {
                return None;
            }
            let fields: Vec<FieldConflict> = ours
                .field_changes(theirs)
                .into_iter()
                .map(FieldConflict::from)
                .collect();
            if fields.is_empty() {
                return None;
            }
            Some(IssueConflict {
                issue: theirs.key.clone(),
                local_updated_at: ours.updated_at,
                remote_updated_at: theirs.updated_at,
                fields,
            })
        })
        .collect();
    conflicts.sort_by(|a, b| a.issue.cmp(&b.issue));
    conflicts.dedup_by(|a, b| a.issue == b.issue);
    conflicts
}
