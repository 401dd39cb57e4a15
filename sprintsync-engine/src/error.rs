//! Error types for sprintsync-engine.

use std::path::PathBuf;

use thiserror::Error;

use sprintsync_core::{
    error::ConfigError,
    types::{EntityKey, FailureKind, SprintId, TeamId},
};

/// Errors from the snapshot store, sync tracker and comparison engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Snapshot or state persistence failed, with annotated path for context.
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored document could not be decoded.
    #[error("corrupt document at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// `compare` was handed snapshots of two different sprints.
    #[error("cannot compare snapshots of different sprints ({older} vs {newer})")]
    InvalidComparison { older: SprintId, newer: SprintId },

    /// The lease was taken over or released before the caller finished.
    #[error("lease for {key} is no longer held")]
    LeaseLost { key: EntityKey },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Convenience constructor for [`EngineError::Storage`].
pub(crate) fn storage_err(path: impl Into<PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Storage {
        path: path.into(),
        source,
    }
}

/// Failure reported by the external issue source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Network failure, timeout, 5xx, 408 or 429. Retried with backoff.
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// Auth failure, other 4xx or an unreadable payload. Not retried.
    #[error("permanent fetch error: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            FetchError::Transient(_) => FailureKind::Transient,
            FetchError::Permanent(_) => FailureKind::Permanent,
        }
    }
}

/// Caller errors from queue generation. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("capacity profile references unknown team '{team}'")]
    InvalidCapacityProfile { team: TeamId },

    #[error("snapshot of sprint {sprint} has no issues and no teams are configured")]
    EmptySnapshot { sprint: SprintId },
}
