//! `sprintsync refresh`: fetch sprints now, through the daemon when it runs.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use sprintsync_core::types::SprintId;
use sprintsync_daemon::{refresh_once_blocking, request_refresh, DaemonError, RefreshResult};

/// Arguments for `sprintsync refresh`.
#[derive(Args, Debug)]
pub struct RefreshArgs {
    /// Sprint to refresh (omit, or use `--all`, for every tracked sprint).
    pub sprint: Option<String>,

    /// Refresh every tracked sprint.
    #[arg(long, conflicts_with = "sprint")]
    pub all: bool,
}

impl RefreshArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let sprint = if self.all { None } else { self.sprint };

        let results = match request_refresh(&home, sprint.clone()) {
            Ok(data) => {
                serde_json::from_value::<Vec<RefreshResult>>(data)
                    .context("daemon returned an unexpected refresh payload")?
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                refresh_once_blocking(&home, sprint.clone().map(SprintId::from))
                    .context("refresh failed")?
            }
            Err(err) => return Err(err).context("daemon refresh failed"),
        };

        if results.is_empty() {
            println!("No sprints to refresh. Run `sprintsync sprint add <id>` first.");
            return Ok(());
        }

        let mut failed = 0usize;
        for result in &results {
            if matches!(result, RefreshResult::Failed { .. }) {
                failed += 1;
            }
            println!("{}", describe(result));
        }
        if failed > 0 {
            anyhow::bail!("{failed} of {} sprint refreshes failed", results.len());
        }
        Ok(())
    }
}

fn describe(result: &RefreshResult) -> String {
    match result {
        RefreshResult::Refreshed {
            sprint,
            snapshot_id,
            issue_count,
            conflicts,
            unchanged,
            attempts,
        } => {
            let mut line = format!(
                "{} '{sprint}' — {issue_count} issues → {snapshot_id}",
                "✓".green()
            );
            if *unchanged {
                line.push_str(" (unchanged)");
            }
            if *conflicts > 0 {
                line.push_str(&format!(", {conflicts} conflicts (remote wins)"));
            }
            if *attempts > 1 {
                line.push_str(&format!(", {attempts} attempts"));
            }
            line
        }
        RefreshResult::Busy { sprint } => {
            format!("{} '{sprint}' — refresh already in progress", "·".bright_black())
        }
        RefreshResult::Failed {
            sprint,
            kind,
            error,
            attempts,
        } => format!(
            "{} '{sprint}' — {kind:?} failure after {attempts} attempt(s): {error}",
            "✗".red()
        ),
        RefreshResult::Cancelled { sprint } => {
            format!("{} '{sprint}' — cancelled", "·".yellow())
        }
    }
}
