//! Template contexts: display-ready payloads built from engine results.
//!
//! Numbers are formatted here so templates stay free of arithmetic.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use sprintsync_core::types::{CapacityUnit, Issue, Queue};
use sprintsync_engine::compare::{ComparisonResult, SnapshotSummary};

use crate::error::RenderError;

/// Report metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaCtx {
    pub version: String,
    pub generated_at: String,
}

impl MetaCtx {
    fn now() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: timestamp(Utc::now()),
        }
    }
}

/// One issue as a table row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRow {
    pub key: String,
    pub title: String,
    pub status: String,
    pub priority: String,
    pub points: String,
    pub team: String,
    pub assignee: String,
}

impl IssueRow {
    fn of(issue: &Issue) -> Self {
        Self {
            key: issue.key.0.clone(),
            title: issue.title.clone(),
            status: issue.status.clone(),
            priority: issue.priority.to_string(),
            points: issue
                .story_points
                .map(format_points)
                .unwrap_or_else(|| "-".to_string()),
            team: issue
                .team
                .as_ref()
                .map(|t| t.0.clone())
                .unwrap_or_else(|| "unassigned".to_string()),
            assignee: issue.assignee.clone().unwrap_or_else(|| "-".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideCtx {
    pub snapshot_id: String,
    pub captured_at: String,
    pub issue_count: usize,
    pub story_points: String,
}

impl SideCtx {
    fn of(summary: &SnapshotSummary) -> Self {
        Self {
            snapshot_id: summary.snapshot_id.0.clone(),
            captured_at: timestamp(summary.captured_at),
            issue_count: summary.issue_count,
            story_points: format_points(summary.story_points),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRow {
    pub field: String,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRow {
    pub key: String,
    pub title: String,
    pub fields: Vec<FieldRow>,
}

/// Status count on both sides of a comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRow {
    pub status: String,
    pub older: usize,
    pub newer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonCtx {
    pub sprint_id: String,
    pub older: SideCtx,
    pub newer: SideCtx,
    pub story_point_delta: String,
    /// `None` when the older snapshot had no points.
    pub story_point_delta_pct: Option<String>,
    pub added: Vec<IssueRow>,
    pub removed: Vec<IssueRow>,
    pub changed: Vec<ChangeRow>,
    pub unchanged: usize,
    pub statuses: Vec<StatusRow>,
    pub is_empty: bool,
    pub meta: MetaCtx,
}

impl ComparisonCtx {
    pub fn from_result(result: &ComparisonResult) -> Self {
        let status_names: BTreeSet<&String> = result
            .older
            .status_histogram
            .keys()
            .chain(result.newer.status_histogram.keys())
            .collect();
        let statuses = status_names
            .into_iter()
            .map(|status| StatusRow {
                status: status.clone(),
                older: result.older.status_histogram.get(status).copied().unwrap_or(0),
                newer: result.newer.status_histogram.get(status).copied().unwrap_or(0),
            })
            .collect();

        let changed = result
            .changed
            .iter()
            .map(|change| ChangeRow {
                key: change.key.0.clone(),
                title: change.title.clone(),
                fields: change
                    .changes
                    .iter()
                    .map(|field| {
                        let (before, after) = field.display_values();
                        FieldRow {
                            field: field.field_name().to_string(),
                            before,
                            after,
                        }
                    })
                    .collect(),
            })
            .collect();

        Self {
            sprint_id: result.sprint_id.0.clone(),
            older: SideCtx::of(&result.older),
            newer: SideCtx::of(&result.newer),
            story_point_delta: signed(result.story_point_delta(), format_points),
            story_point_delta_pct: result
                .story_point_delta_pct
                .map(|pct| format!("{}%", signed(pct, |v| format!("{v:.1}")))),
            added: result.added.iter().map(IssueRow::of).collect(),
            removed: result.removed.iter().map(IssueRow::of).collect(),
            changed,
            unchanged: result.unchanged,
            statuses,
            is_empty: result.is_empty(),
            meta: MetaCtx::now(),
        }
    }

    pub fn to_tera_context(&self) -> Result<tera::Context, RenderError> {
        tera::Context::from_serialize(self).map_err(RenderError::from)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRow {
    pub position: usize,
    pub issue: IssueRow,
    /// At or past the queue-wide cut-line.
    pub over_capacity: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRow {
    pub team: String,
    pub issue_count: usize,
    pub load: String,
    pub limit: String,
    pub cut_line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCtx {
    pub sprint_id: String,
    pub snapshot_id: String,
    pub unit: String,
    pub entries: Vec<EntryRow>,
    pub teams: Vec<TeamRow>,
    pub cut_line: Option<usize>,
    pub meta: MetaCtx,
}

impl QueueCtx {
    pub fn from_queue(queue: &Queue) -> Self {
        let entries = queue
            .entries
            .iter()
            .map(|entry| EntryRow {
                position: entry.position,
                issue: IssueRow::of(&entry.issue),
                over_capacity: queue.cut_line.is_some_and(|cut| entry.position >= cut),
            })
            .collect();

        // Teams in first-appearance order.
        let mut teams: Vec<TeamRow> = Vec::new();
        for entry in &queue.entries {
            let Some(team) = &entry.team else {
                continue;
            };
            if teams.iter().any(|row| row.team == team.0) {
                continue;
            }
            let (count, load) = queue
                .entries
                .iter()
                .filter(|e| e.team.as_ref() == Some(team))
                .fold((0usize, 0.0f64), |(count, load), e| {
                    let weight = match queue.unit {
                        CapacityUnit::Points => e.issue.points(),
                        CapacityUnit::Issues => 1.0,
                    };
                    (count + 1, load + weight)
                });
            teams.push(TeamRow {
                team: team.0.clone(),
                issue_count: count,
                load: format_points(load),
                limit: queue
                    .limits
                    .get(team)
                    .map(|limit| format_points(*limit))
                    .unwrap_or_else(|| "-".to_string()),
                cut_line: queue
                    .team_cut_lines
                    .get(team)
                    .map(|pos| format!("#{pos}"))
                    .unwrap_or_else(|| "-".to_string()),
            });
        }

        Self {
            sprint_id: queue.sprint_id.0.clone(),
            snapshot_id: queue.snapshot_id.0.clone(),
            unit: match queue.unit {
                CapacityUnit::Points => "points".to_string(),
                CapacityUnit::Issues => "issues".to_string(),
            },
            entries,
            teams,
            cut_line: queue.cut_line,
            meta: MetaCtx::now(),
        }
    }

    pub fn to_tera_context(&self) -> Result<tera::Context, RenderError> {
        tera::Context::from_serialize(self).map_err(RenderError::from)
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

/// `3` for whole numbers, `2.5` otherwise.
pub fn format_points(points: f64) -> String {
    if points.fract() == 0.0 {
        format!("{points:.0}")
    } else {
        format!("{points}")
    }
}

fn signed(value: f64, fmt: impl Fn(f64) -> String) -> String {
    if value > 0.0 {
        format!("+{}", fmt(value))
    } else {
        fmt(value)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_drop_trailing_zero() {
        assert_eq!(format_points(3.0), "3");
        assert_eq!(format_points(2.5), "2.5");
        assert_eq!(format_points(0.0), "0");
    }

    #[test]
    fn signed_adds_plus_for_positive_only() {
        assert_eq!(signed(3.0, format_points), "+3");
        assert_eq!(signed(-2.0, format_points), "-2");
        assert_eq!(signed(0.0, format_points), "0");
    }
}
