//! `sprintsync status`: sync state and freshness per sprint.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use sprintsync_daemon::{collect_status_at, request_status, DaemonError, SprintStatus};
use sprintsync_engine::freshness::{format_datetime_age, format_seconds};
use sprintsync_engine::FreshnessSignal;

/// Arguments for `sprintsync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;

        let (daemon_running, sprints) = match request_status(&home) {
            Ok(payload) => {
                let sprints: Vec<SprintStatus> =
                    serde_json::from_value(payload["sprints"].clone())
                        .context("daemon returned an unexpected status payload")?;
                (true, sprints)
            }
            Err(DaemonError::DaemonNotRunning { .. }) => (
                false,
                collect_status_at(&home)
                    .context("failed to read sync state — run `sprintsync init` first")?,
            ),
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            print_json(daemon_running, sprints)
        } else {
            print_table(daemon_running, &sprints);
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct StatusReportJson {
    summary: StatusSummaryJson,
    sprints: Vec<SprintStatus>,
}

#[derive(Serialize)]
struct StatusSummaryJson {
    daemon_running: bool,
    sprints: usize,
    failing: usize,
    stale: usize,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "")]
    indicator: String,
    #[tabled(rename = "sprint")]
    sprint: String,
    #[tabled(rename = "freshness")]
    freshness: String,
    #[tabled(rename = "detail")]
    detail: String,
    #[tabled(rename = "last success")]
    last_success: String,
    #[tabled(rename = "snapshots")]
    snapshots: usize,
    #[tabled(rename = "issues")]
    issues: usize,
}

fn print_json(daemon_running: bool, sprints: Vec<SprintStatus>) -> Result<()> {
    let payload = StatusReportJson {
        summary: StatusSummaryJson {
            daemon_running,
            sprints: sprints.len(),
            failing: count(&sprints, |s| matches!(s, FreshnessSignal::Failing { .. })),
            stale: count(&sprints, |s| matches!(s, FreshnessSignal::Stale { .. })),
        },
        sprints,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to render status JSON")?
    );
    Ok(())
}

fn print_table(daemon_running: bool, sprints: &[SprintStatus]) {
    if sprints.is_empty() {
        println!("No sprints tracked. Run `sprintsync sprint add <id>` first.");
        return;
    }

    let daemon = if daemon_running {
        "running".green().to_string()
    } else {
        "not running".bright_black().to_string()
    };
    println!("daemon: {daemon}");

    let rows: Vec<StatusTableRow> = sprints
        .iter()
        .map(|row| StatusTableRow {
            indicator: signal_indicator(&row.signal),
            sprint: row.sprint.clone(),
            freshness: row.signal.label().to_uppercase(),
            detail: signal_detail(row),
            last_success: row
                .last_success_at
                .map(|at| format!("{} ago", format_datetime_age(at)))
                .unwrap_or_else(|| "never".to_string()),
            snapshots: row.snapshots,
            issues: row.issue_count,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    let failing = count(sprints, |s| matches!(s, FreshnessSignal::Failing { .. }));
    if failing > 0 {
        println!("Run 'sprintsync refresh <sprint>' to retry failing sprints.");
    }
}

fn count(sprints: &[SprintStatus], pred: impl Fn(&FreshnessSignal) -> bool) -> usize {
    sprints.iter().filter(|s| pred(&s.signal)).count()
}

fn signal_indicator(signal: &FreshnessSignal) -> String {
    match signal {
        FreshnessSignal::Skipped { .. } => "■".bright_black().bold().to_string(),
        FreshnessSignal::Refreshing => "■".blue().bold().to_string(),
        FreshnessSignal::Failing { .. } => "■".red().bold().to_string(),
        FreshnessSignal::NoData => "■".bright_black().bold().to_string(),
        FreshnessSignal::Stale { .. } => "■".yellow().bold().to_string(),
        FreshnessSignal::Current { .. } => "■".green().bold().to_string(),
    }
}

fn signal_detail(row: &SprintStatus) -> String {
    match &row.signal {
        FreshnessSignal::Skipped { reason } => reason.clone(),
        FreshnessSignal::Refreshing => "refresh in progress".to_string(),
        FreshnessSignal::Failing {
            errors, message, ..
        } => format!("{errors} error(s): {}", truncate(message, 60)),
        FreshnessSignal::NoData => "no snapshot yet".to_string(),
        FreshnessSignal::Stale { age_secs } | FreshnessSignal::Current { age_secs } => {
            let mut detail = format!("captured {} ago", format_seconds(*age_secs));
            if row.conflicts > 0 {
                detail.push_str(&format!(", {} conflicts", row.conflicts));
            }
            detail
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
