//! `sprintsync daemon`: background refresh daemon lifecycle.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use colored::Colorize;

use sprintsync_core::config::config_path_at;
use sprintsync_daemon::paths::{socket_path, stderr_log_path, stdout_log_path};
use sprintsync_daemon::{request_status, request_stop, start_blocking, DaemonError, SprintStatus};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (scheduler, config watcher, socket server).
    Start,
    /// Ask a running daemon to shut down.
    Stop,
    /// Show whether the daemon runs and what it tracks.
    Status(DaemonStatusArgs),
    /// Print recent daemon log lines.
    Logs(DaemonLogsArgs),
}

#[derive(Args, Debug)]
pub struct DaemonStatusArgs {
    /// Print the raw status payload.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DaemonLogsArgs {
    /// Number of trailing lines per log file.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,

    /// Which log file to print.
    #[arg(long, value_enum, default_value_t = LogStream::Both)]
    pub stream: LogStream,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    Both,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;

    match command {
        DaemonCommand::Start => start(&home),
        DaemonCommand::Stop => {
            match request_stop(&home) {
                Ok(()) => println!("daemon stop requested"),
                Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
                Err(err) => return Err(err).context("failed to stop daemon"),
            }
            Ok(())
        }
        DaemonCommand::Status(args) => status(&home, args.json),
        DaemonCommand::Logs(args) => {
            if args.stream != LogStream::Stderr {
                print_tail(&stdout_log_path(&home), args.lines)
                    .context("failed to read daemon stdout log")?;
            }
            if args.stream != LogStream::Stdout {
                print_tail(&stderr_log_path(&home), args.lines)
                    .context("failed to read daemon stderr log")?;
            }
            Ok(())
        }
    }
}

fn start(home: &Path) -> Result<()> {
    let config = config_path_at(home);
    if !config.exists() {
        anyhow::bail!(
            "no config at {}: run `sprintsync init` first",
            config.display()
        );
    }
    println!(
        "sprintsync daemon listening on {}",
        socket_path(home).display()
    );
    start_blocking(home).context("daemon exited with error")
}

fn status(home: &Path, json: bool) -> Result<()> {
    let payload = match request_status(home) {
        Ok(payload) => Some(payload),
        Err(DaemonError::DaemonNotRunning { .. }) => None,
        Err(err) => return Err(err).context("failed to query daemon status"),
    };

    if json {
        let payload = payload.unwrap_or_else(|| {
            serde_json::json!({
                "running": false,
                "socket": socket_path(home).display().to_string(),
            })
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&payload)
                .context("failed to render daemon status JSON")?
        );
        return Ok(());
    }

    let Some(payload) = payload else {
        println!("daemon is not running");
        return Ok(());
    };
    let sprints: Vec<SprintStatus> = serde_json::from_value(payload["sprints"].clone())
        .context("daemon returned an unexpected status payload")?;
    println!(
        "{} daemon running (pid {}, started {})",
        "●".green(),
        payload["pid"].as_u64().unwrap_or_default(),
        payload["started_at"].as_str().unwrap_or("unknown"),
    );
    for sprint in &sprints {
        println!(
            "  {:<16} {:<10} {} snapshot(s)",
            sprint.sprint,
            sprint.signal.label(),
            sprint.snapshots
        );
    }
    if sprints.is_empty() {
        println!("  no sprints tracked");
    }
    Ok(())
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut tail = VecDeque::<String>::with_capacity(lines);
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if lines == 0 {
            continue;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    println!("==> {} <==", path.display());
    for line in tail {
        println!("{line}");
    }
    Ok(())
}
