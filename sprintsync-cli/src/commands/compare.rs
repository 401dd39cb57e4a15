//! `sprintsync compare <sprint>`: latest snapshot against an earlier one.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;

use sprintsync_core::types::SprintId;
use sprintsync_daemon::paths::templates_dir;
use sprintsync_engine::{compare, ComparisonResult, FileSnapshotStore, SnapshotStore};
use sprintsync_report::{context::format_points, Renderer};

use super::super::OutputArgs;

/// Arguments for `sprintsync compare`.
#[derive(Args, Debug)]
pub struct CompareArgs {
    /// Sprint id.
    pub sprint: String,

    /// Baseline is the latest snapshot captured before this instant
    /// (RFC 3339). Defaults to the snapshot before the latest.
    #[arg(long, value_name = "RFC3339")]
    pub before: Option<DateTime<Utc>>,

    #[command(flatten)]
    pub output: OutputArgs,
}

impl CompareArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let store = FileSnapshotStore::open_at(&home);
        let sprint = SprintId::from(self.sprint.as_str());

        let newer = store
            .latest(&sprint)
            .with_context(|| format!("failed to read snapshots for '{sprint}'"))?
            .with_context(|| {
                format!("no snapshots for '{sprint}' — run `sprintsync refresh {sprint}` first")
            })?;
        let cutoff = self.before.unwrap_or(newer.captured_at);
        let older = store
            .before(&sprint, cutoff)
            .with_context(|| format!("failed to read snapshots for '{sprint}'"))?
            .with_context(|| {
                format!(
                    "no snapshot of '{sprint}' captured before {}",
                    cutoff.to_rfc3339()
                )
            })?;

        let result = compare(&older, &newer).context("comparison failed")?;

        if self.output.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&result).context("failed to render comparison JSON")?
            );
        } else if self.output.markdown {
            let renderer = Renderer::with_overrides(&templates_dir(&home))
                .context("failed to load report templates")?;
            print!(
                "{}",
                renderer
                    .render_comparison(&result)
                    .context("failed to render comparison report")?
            );
        } else {
            print_summary(&result);
        }
        Ok(())
    }
}

fn print_summary(result: &ComparisonResult) {
    println!(
        "{} {} → {}",
        result.sprint_id.to_string().bold(),
        result.older.captured_at.format("%Y-%m-%d %H:%M"),
        result.newer.captured_at.format("%Y-%m-%d %H:%M"),
    );

    if result.is_empty() {
        println!("  no changes ({} issues unchanged)", result.unchanged);
        return;
    }

    for issue in &result.added {
        println!("  {} {} {}", "+".green(), issue.key, issue.title);
    }
    for issue in &result.removed {
        println!("  {} {} {}", "-".red(), issue.key, issue.title);
    }
    for change in &result.changed {
        let fields: Vec<String> = change
            .changes
            .iter()
            .map(|field| {
                let (before, after) = field.display_values();
                format!("{} {before} → {after}", field.field_name())
            })
            .collect();
        println!("  {} {} {}", "~".yellow(), change.key, fields.join("; "));
    }

    let pct = result
        .story_point_delta_pct
        .map(|pct| format!(" ({pct:+.1}%)"))
        .unwrap_or_default();
    println!(
        "  points {} → {}{pct}, {} unchanged",
        format_points(result.older.story_points),
        format_points(result.newer.story_points),
        result.unchanged,
    );
}
