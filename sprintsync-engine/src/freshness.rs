//! Freshness signal for a tracked sprint.
//!
//! Signal precedence:
//! 1. `Skipped` (sprint excluded from refresh)
//! 2. `Refreshing` (a refresh holds the lease)
//! 3. `Failing` (last attempt failed)
//! 4. `NoData` (no snapshot captured yet)
//! 5. `Stale` (latest snapshot older than the refresh interval)
//! 6. `Current`

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use sprintsync_core::types::{FailureKind, SyncState, SyncStatus};

use crate::snapshot_store::SnapshotMeta;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum FreshnessSignal {
    Skipped {
        reason: String,
    },
    Refreshing,
    Failing {
        errors: u32,
        kind: Option<FailureKind>,
        message: String,
    },
    NoData,
    Stale {
        age_secs: u64,
    },
    Current {
        age_secs: u64,
    },
}

impl FreshnessSignal {
    /// Short label used in status tables.
    pub fn label(&self) -> &'static str {
        match self {
            FreshnessSignal::Skipped { .. } => "skipped",
            FreshnessSignal::Refreshing => "refreshing",
            FreshnessSignal::Failing { .. } => "failing",
            FreshnessSignal::NoData => "no data",
            FreshnessSignal::Stale { .. } => "stale",
            FreshnessSignal::Current { .. } => "current",
        }
    }
}

/// Classify a sprint from its sync record and latest snapshot.
pub fn check(
    state: Option<&SyncState>,
    latest: Option<&SnapshotMeta>,
    interval: Duration,
    now: DateTime<Utc>,
) -> FreshnessSignal {
    if let Some(state) = state {
        match state.status {
            SyncStatus::Skipped => {
                return FreshnessSignal::Skipped {
                    reason: state.skip_reason.clone().unwrap_or_default(),
                }
            }
            SyncStatus::InProgress => return FreshnessSignal::Refreshing,
            SyncStatus::Failed if state.error_count > 0 => {
                return FreshnessSignal::Failing {
                    errors: state.error_count,
                    kind: state.failure,
                    message: state.last_error.clone().unwrap_or_default(),
                }
            }
            _ => {}
        }
    }

    let Some(latest) = latest else {
        return FreshnessSignal::NoData;
    };
    let age = now - latest.captured_at;
    let age_secs = age.num_seconds().max(0) as u64;
    if age > interval {
        FreshnessSignal::Stale { age_secs }
    } else {
        FreshnessSignal::Current { age_secs }
    }
}

/// Format age from a chrono timestamp relative to now.
pub fn format_datetime_age(timestamp: DateTime<Utc>) -> String {
    let age = Utc::now().signed_duration_since(timestamp).num_seconds().max(0) as u64;
    format_seconds(age)
}

/// `42s`, `5m`, `3h`, `2d`.
pub fn format_seconds(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}
