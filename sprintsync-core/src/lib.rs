//! sprintsync core library: domain types, config file persistence, errors.
//!
//! - [`types`]: issues, snapshots, sync state, capacity and queue values
//! - [`config`]: `~/.sprintsync/config.yaml` load / save / init
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, RefreshSettings, SourceSettings, SprintEntry, TeamEntry};
pub use error::ConfigError;
pub use types::{
    CapacityPlan, CapacityProfile, CapacityUnit, ConflictRecord, EntityKey, EntityKind,
    FailureKind, FieldChange, FieldConflict, Issue, IssueConflict, IssueKey, Priority, Queue,
    QueueEntry, ResolutionStrategy, SnapshotId, SprintId, SprintSnapshot, SprintState, SyncState,
    SyncStatus, TeamId,
};
