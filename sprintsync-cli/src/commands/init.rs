//! `sprintsync init [--base-url <url>]`

use anyhow::{Context, Result};
use clap::Args;

use sprintsync_core::config;

/// Create the sprintsync config file.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Base URL of the issue tracker API (e.g. https://tracker.example.com/api).
    #[arg(long)]
    pub base_url: Option<String>,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let (config, created) =
            config::init_at(&home, self.base_url).context("failed to initialise sprintsync")?;
        let path = config::config_path_at(&home);

        if created {
            println!("✓ Created {}", path.display());
        } else {
            println!("✓ Already initialised: {}", path.display());
        }
        println!("  Source: {}", config.source.base_url);
        println!("  Sprints tracked: {}", config.sprints.len());
        if config.sprints.is_empty() {
            println!("Next: sprintsync sprint add <id>");
        }
        Ok(())
    }
}
