//! `sprintsync queue <sprint>`: capacity-aware work queue with cut-lines.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use sprintsync_core::config;
use sprintsync_core::types::{Queue, SprintId};
use sprintsync_daemon::paths::templates_dir;
use sprintsync_engine::{queue, FileSnapshotStore, SnapshotStore};
use sprintsync_report::{context::format_points, Renderer};

use super::super::OutputArgs;

/// Arguments for `sprintsync queue`.
#[derive(Args, Debug)]
pub struct QueueArgs {
    /// Sprint id.
    pub sprint: String,

    #[command(flatten)]
    pub output: OutputArgs,
}

impl QueueArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let config =
            config::load_at(&home).context("failed to load config — run `sprintsync init` first")?;
        let store = FileSnapshotStore::open_at(&home);
        let sprint = SprintId::from(self.sprint.as_str());

        let snapshot = store
            .latest(&sprint)
            .with_context(|| format!("failed to read snapshots for '{sprint}'"))?
            .with_context(|| {
                format!("no snapshots for '{sprint}' — run `sprintsync refresh {sprint}` first")
            })?;
        let queue = queue::generate(&snapshot, &config.capacity_plan())
            .with_context(|| format!("cannot build queue for '{sprint}'"))?;

        if self.output.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&queue).context("failed to render queue JSON")?
            );
        } else if self.output.markdown {
            let renderer = Renderer::with_overrides(&templates_dir(&home))
                .context("failed to load report templates")?;
            print!(
                "{}",
                renderer
                    .render_queue(&queue)
                    .context("failed to render queue report")?
            );
        } else {
            print_table(&queue);
        }
        Ok(())
    }
}

#[derive(Tabled)]
struct QueueTableRow {
    #[tabled(rename = "#")]
    position: String,
    #[tabled(rename = "issue")]
    key: String,
    #[tabled(rename = "team")]
    team: String,
    #[tabled(rename = "priority")]
    priority: String,
    #[tabled(rename = "points")]
    points: String,
    #[tabled(rename = "title")]
    title: String,
}

fn print_table(queue: &Queue) {
    if queue.entries.is_empty() {
        println!("Queue for '{}' is empty.", queue.sprint_id);
        return;
    }

    let rows: Vec<QueueTableRow> = queue
        .entries
        .iter()
        .map(|entry| {
            let over = queue.cut_line.is_some_and(|cut| entry.position >= cut);
            let position = if over {
                entry.position.to_string().red().to_string()
            } else {
                entry.position.to_string()
            };
            QueueTableRow {
                position,
                key: entry.issue.key.to_string(),
                team: entry
                    .team
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "unassigned".to_string()),
                priority: entry.issue.priority.to_string(),
                points: entry
                    .issue
                    .story_points
                    .map(format_points)
                    .unwrap_or_else(|| "-".to_string()),
                title: entry.issue.title.clone(),
            }
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    match queue.cut_line {
        Some(cut) => println!("{} cut-line at position {cut}", "✂".red()),
        None => println!("{} all work fits within capacity", "✓".green()),
    }
    for (team, pos) in &queue.team_cut_lines {
        println!("  {team}: over capacity from #{pos}");
    }
}
