//! Domain types for sprint snapshots, sync state, capacity and queues.
//!
//! Everything here is a plain serde value. Snapshots, issues and queues are
//! immutable once built; the engine only ever produces new values.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier of a sprint in the external tracker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SprintId(pub String);

impl fmt::Display for SprintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SprintId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SprintId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// External issue key (e.g. `PAY-142`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IssueKey(pub String);

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for IssueKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for IssueKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Discipline-team tag (e.g. `backend`, `qa`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TeamId(pub String);

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for TeamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TeamId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a stored snapshot: `<sprint>@<capture millis>-<seq>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

/// Issue priority. Ordering runs from `Lowest` to `Highest`.
///
/// Deserialization is lenient: names match case-insensitively, the
/// blocker/critical/major/minor/trivial scheme maps onto the five levels,
/// and `null` or an unrecognised name falls back to `Medium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Medium,
    High,
    Highest,
}

impl Priority {
    pub fn from_name(name: &str) -> Priority {
        match name.trim().to_ascii_lowercase().as_str() {
            "highest" | "blocker" => Priority::Highest,
            "high" | "critical" => Priority::High,
            "low" | "minor" => Priority::Low,
            "lowest" | "trivial" => Priority::Lowest,
            _ => Priority::Medium,
        }
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = Option::<String>::deserialize(deserializer)?;
        Ok(name.as_deref().map_or(Priority::Medium, Priority::from_name))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Lowest => write!(f, "lowest"),
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Highest => write!(f, "highest"),
        }
    }
}

/// A single issue as captured from the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub key: IssueKey,
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<TeamId>,
    /// Last-modified timestamp reported by the tracker (source of truth).
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    /// Story points, treating an unestimated issue as zero.
    pub fn points(&self) -> f64 {
        self.story_points.unwrap_or(0.0)
    }

    /// Tracked field differences going from `self` to `other`.
    ///
    /// Only status, priority, story points and assignee are tracked; title and
    /// reporter edits are not reported.
    pub fn field_changes(&self, other: &Issue) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        if self.status != other.status {
            changes.push(FieldChange::Status {
                before: self.status.clone(),
                after: other.status.clone(),
            });
        }
        if self.priority != other.priority {
            changes.push(FieldChange::Priority {
                before: self.priority,
                after: other.priority,
            });
        }
        if self.story_points != other.story_points {
            changes.push(FieldChange::StoryPoints {
                before: self.story_points,
                after: other.story_points,
            });
        }
        if self.assignee != other.assignee {
            changes.push(FieldChange::Assignee {
                before: self.assignee.clone(),
                after: other.assignee.clone(),
            });
        }
        changes
    }
}

/// Before/after record of one tracked field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum FieldChange {
    Status {
        before: String,
        after: String,
    },
    Priority {
        before: Priority,
        after: Priority,
    },
    StoryPoints {
        before: Option<f64>,
        after: Option<f64>,
    },
    Assignee {
        before: Option<String>,
        after: Option<String>,
    },
}

impl FieldChange {
    pub fn field_name(&self) -> &'static str {
        match self {
            FieldChange::Status { .. } => "status",
            FieldChange::Priority { .. } => "priority",
            FieldChange::StoryPoints { .. } => "story_points",
            FieldChange::Assignee { .. } => "assignee",
        }
    }

    /// `(before, after)` rendered for display.
    pub fn display_values(&self) -> (String, String) {
        match self {
            FieldChange::Status { before, after } => (before.clone(), after.clone()),
            FieldChange::Priority { before, after } => (before.to_string(), after.to_string()),
            FieldChange::StoryPoints { before, after } => {
                (display_points(*before), display_points(*after))
            }
            FieldChange::Assignee { before, after } => {
                (display_person(before), display_person(after))
            }
        }
    }
}

fn display_points(points: Option<f64>) -> String {
    points.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
}

fn display_person(person: &Option<String>) -> String {
    person.clone().unwrap_or_else(|| "unassigned".to_string())
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Lifecycle state of a sprint in the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SprintState {
    Future,
    #[default]
    Active,
    Closed,
}

impl fmt::Display for SprintState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SprintState::Future => write!(f, "future"),
            SprintState::Active => write!(f, "active"),
            SprintState::Closed => write!(f, "closed"),
        }
    }
}

/// Immutable capture of a sprint's issue set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SprintSnapshot {
    pub id: SnapshotId,
    pub sprint_id: SprintId,
    pub state: SprintState,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub issues: Vec<Issue>,
}

impl SprintSnapshot {
    pub fn total_points(&self) -> f64 {
        self.issues.iter().map(Issue::points).sum()
    }
}

// ---------------------------------------------------------------------------
// Sync state
// ---------------------------------------------------------------------------

/// Kind of entity whose synchronization is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Sprint,
    Issue,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Sprint => write!(f, "sprint"),
            EntityKind::Issue => write!(f, "issue"),
        }
    }
}

/// `(kind, id)` key of a sync state record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn sprint(id: &SprintId) -> Self {
        Self {
            kind: EntityKind::Sprint,
            id: id.0.clone(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Pending => write!(f, "pending"),
            SyncStatus::InProgress => write!(f, "in_progress"),
            SyncStatus::Completed => write!(f, "completed"),
            SyncStatus::Failed => write!(f, "failed"),
            SyncStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why the last attempt failed. Decides whether the entity is retried
/// automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error or timeout; retried after the cooldown.
    Transient,
    /// Auth or other 4xx; waits for manual intervention or a config change.
    Permanent,
    /// Snapshot persistence failed; retried after the cooldown.
    Storage,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::Permanent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    #[default]
    RemoteWins,
    LocalWins,
    Manual,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionStrategy::RemoteWins => write!(f, "remote_wins"),
            ResolutionStrategy::LocalWins => write!(f, "local_wins"),
            ResolutionStrategy::Manual => write!(f, "manual"),
        }
    }
}

/// One field on which the local copy and the remote read disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum FieldConflict {
    Status {
        local: String,
        remote: String,
    },
    Priority {
        local: Priority,
        remote: Priority,
    },
    StoryPoints {
        local: Option<f64>,
        remote: Option<f64>,
    },
    Assignee {
        local: Option<String>,
        remote: Option<String>,
    },
}

impl From<FieldChange> for FieldConflict {
    /// Reads a local→remote change as a divergence.
    fn from(change: FieldChange) -> Self {
        match change {
            FieldChange::Status { before, after } => FieldConflict::Status {
                local: before,
                remote: after,
            },
            FieldChange::Priority { before, after } => FieldConflict::Priority {
                local: before,
                remote: after,
            },
            FieldChange::StoryPoints { before, after } => FieldConflict::StoryPoints {
                local: before,
                remote: after,
            },
            FieldChange::Assignee { before, after } => FieldConflict::Assignee {
                local: before,
                remote: after,
            },
        }
    }
}

/// Divergences detected on a single issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueConflict {
    pub issue: IssueKey,
    pub local_updated_at: DateTime<Utc>,
    pub remote_updated_at: DateTime<Utc>,
    pub fields: Vec<FieldConflict>,
}

/// Conflicts attached to a sync state record, with the strategy applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub detected_at: DateTime<Utc>,
    pub strategy: ResolutionStrategy,
    pub conflicts: Vec<IssueConflict>,
}

/// Current synchronization record for one entity. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub key: EntityKey,
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<ConflictRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub api_calls: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    pub fn new(key: EntityKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            status: SyncStatus::Pending,
            last_attempt_at: None,
            last_success_at: None,
            error_count: 0,
            last_error: None,
            failure: None,
            conflicts: None,
            duration_ms: None,
            api_calls: 0,
            skip_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Capacity and queues
// ---------------------------------------------------------------------------

/// What a capacity limit counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CapacityUnit {
    #[default]
    Points,
    Issues,
}

/// Number of trailing velocity entries averaged into a suggested limit.
pub const VELOCITY_WINDOW: usize = 3;

/// Capacity configuration for one discipline team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityProfile {
    pub team: TeamId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    /// Completed totals of past sprints, oldest first.
    #[serde(default)]
    pub velocity: Vec<f64>,
}

impl CapacityProfile {
    /// Explicit limit, or the mean of the last [`VELOCITY_WINDOW`] velocity
    /// entries. `None` means capacity is not enforced for the team.
    pub fn effective_limit(&self) -> Option<f64> {
        if let Some(limit) = self.limit {
            return Some(limit);
        }
        if self.velocity.is_empty() {
            return None;
        }
        let start = self.velocity.len().saturating_sub(VELOCITY_WINDOW);
        let window = &self.velocity[start..];
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }
}

/// Team roster and capacity profiles handed to the queue engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CapacityPlan {
    #[serde(default)]
    pub unit: CapacityUnit,
    /// Configured teams, in round-robin order.
    #[serde(default)]
    pub roster: Vec<TeamId>,
    #[serde(default)]
    pub profiles: Vec<CapacityProfile>,
}

/// One slot of a generated queue. Positions are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub position: usize,
    pub team: Option<TeamId>,
    pub issue: Issue,
}

/// Fairness-ordered work queue for a sprint. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    pub sprint_id: SprintId,
    pub snapshot_id: SnapshotId,
    pub generated_at: DateTime<Utc>,
    pub unit: CapacityUnit,
    pub entries: Vec<QueueEntry>,
    /// Limit applied per team; teams without enforcement are absent.
    pub limits: BTreeMap<TeamId, f64>,
    /// Position of the first entry that pushed each team over its limit.
    pub team_cut_lines: BTreeMap<TeamId, usize>,
    /// Minimum of all team cut-lines.
    pub cut_line: Option<usize>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
