//! `sprintsync sprint add <id>` and `sprintsync sprint list`

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};

use sprintsync_core::{config, SprintEntry};

use super::super::SprintStateArg;

/// Manage tracked sprints.
#[derive(Subcommand, Debug)]
pub enum SprintCommand {
    /// List tracked sprints.
    List,

    /// Track a sprint, or update one already tracked.
    Add(AddArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Sprint id as known by the tracker (e.g. "PAY-S12").
    pub id: String,

    /// Display name.
    #[arg(long)]
    pub name: Option<String>,

    /// future | active | closed. Defaults to active.
    #[arg(long, value_name = "STATE")]
    pub state: Option<SprintStateArg>,

    /// When the sprint ended (RFC 3339). Closed sprints past the retention
    /// window stop refreshing.
    #[arg(long, value_name = "RFC3339")]
    pub ended_at: Option<DateTime<Utc>>,
}

pub fn run(cmd: SprintCommand) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    match cmd {
        SprintCommand::List => list(&home),
        SprintCommand::Add(args) => add(&home, args),
    }
}

fn list(home: &std::path::Path) -> Result<()> {
    let config =
        config::load_at(home).context("failed to load config — run `sprintsync init` first")?;

    if config.sprints.is_empty() {
        println!("No sprints tracked.");
        println!("Run: sprintsync sprint add <id>");
        return Ok(());
    }

    for sprint in &config.sprints {
        let name = sprint
            .name
            .as_deref()
            .map(|n| format!(" — {n}"))
            .unwrap_or_default();
        let ended = sprint
            .ended_at
            .map(|at| format!(", ended {}", at.format("%Y-%m-%d")))
            .unwrap_or_default();
        println!("  {}{} [{}{}]", sprint.id, name, sprint.state, ended);
    }
    Ok(())
}

fn add(home: &std::path::Path, args: AddArgs) -> Result<()> {
    let mut entry = SprintEntry::new(args.id.clone());
    entry.name = args.name;
    entry.state = args.state.unwrap_or_default().into();
    entry.ended_at = args.ended_at;

    let config = config::add_sprint_at(home, entry).with_context(|| {
        format!(
            "failed to add sprint '{}' — run `sprintsync init` first",
            args.id
        )
    })?;

    println!(
        "✓ Tracking sprint '{}' ({} sprints total)",
        args.id,
        config.sprints.len()
    );
    Ok(())
}
