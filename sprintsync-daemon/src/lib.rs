//! Daemon runtime: refresh scheduler + config watcher + socket server.

mod error;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod scheduler;
pub mod status;

pub use error::DaemonError;
pub use protocol::{
    request_refresh, request_status, request_stop, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{build_scheduler, refresh_once_blocking, run, start_blocking};
pub use scheduler::{RefreshResult, Scheduler, TickSummary, Timing};
pub use status::{collect_status, collect_status_at, SprintStatus};
