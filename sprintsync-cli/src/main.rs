//! sprintsync: sprint snapshot tracking and capacity-aware work queues.
//!
//! # Usage
//!
//! ```text
//! sprintsync init [--base-url <url>]
//! sprintsync sprint add <id> [--name <name>] [--state future|active|closed] [--ended-at <rfc3339>]
//! sprintsync sprint list
//! sprintsync refresh [<sprint>] [--all]
//! sprintsync status [--json]
//! sprintsync compare <sprint> [--before <rfc3339>] [--json|--markdown]
//! sprintsync queue <sprint> [--json|--markdown]
//! sprintsync daemon start|stop|status|logs
//! ```

mod commands;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use commands::{
    compare::CompareArgs, daemon::DaemonCommand, init::InitArgs, queue::QueueArgs,
    refresh::RefreshArgs, sprint::SprintCommand, status::StatusArgs,
};
use sprintsync_core::types::SprintState;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "sprintsync",
    version,
    about = "Keep sprint snapshots fresh and plan work against team capacity",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create ~/.sprintsync/config.yaml.
    Init(InitArgs),

    /// Manage tracked sprints.
    Sprint {
        #[command(subcommand)]
        command: SprintCommand,
    },

    /// Fetch sprints from the tracker now.
    Refresh(RefreshArgs),

    /// Show sync state and freshness per sprint.
    Status(StatusArgs),

    /// Compare the latest snapshot of a sprint with an earlier one.
    Compare(CompareArgs),

    /// Build the capacity-aware work queue from the latest snapshot.
    Queue(QueueArgs),

    /// Manage the background refresh daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared arguments
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `SprintState` from CLI args.
#[derive(Debug, Clone, Copy, Default)]
pub struct SprintStateArg(pub SprintState);

impl FromStr for SprintStateArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "future" => Ok(Self(SprintState::Future)),
            "active" => Ok(Self(SprintState::Active)),
            "closed" => Ok(Self(SprintState::Closed)),
            other => Err(format!(
                "unknown sprint state '{other}'; expected: future, active, closed"
            )),
        }
    }
}

impl fmt::Display for SprintStateArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<SprintStateArg> for SprintState {
    fn from(s: SprintStateArg) -> Self {
        s.0
    }
}

/// `--json` / `--markdown` output switch shared by report commands.
#[derive(Args, Debug, Clone, Copy)]
pub struct OutputArgs {
    /// Emit machine-readable JSON.
    #[arg(long, conflicts_with = "markdown")]
    pub json: bool,

    /// Render the Markdown report.
    #[arg(long)]
    pub markdown: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Sprint { command } => commands::sprint::run(command),
        Commands::Refresh(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Compare(args) => args.run(),
        Commands::Queue(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
