//! sprintsync-engine: snapshot storage, sync state tracking, comparison and
//! queue generation.
//!
//! Nothing here owns a thread or a runtime. The daemon drives refreshes; the
//! CLI reads snapshots and generates reports.

pub mod backoff;
pub mod compare;
pub mod conflict;
pub mod error;
pub mod freshness;
pub mod queue;
pub mod refresh;
pub mod snapshot_store;
pub mod source;
pub mod tracker;

pub use backoff::{Backoff, RetryPolicy};
pub use compare::{compare, ComparisonResult, IssueChange, SnapshotSummary};
pub use conflict::detect_conflicts;
pub use error::{EngineError, FetchError, QueueError};
pub use freshness::FreshnessSignal;
pub use refresh::{apply_fetch, RefreshOutcome};
pub use snapshot_store::{FileSnapshotStore, MemorySnapshotStore, SnapshotMeta, SnapshotStore};
pub use source::{HttpIssueSource, IssueSource, RemoteSprint};
pub use tracker::{Begin, Lease, LeaseTicket, SyncTracker};
