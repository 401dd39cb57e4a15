//! YAML configuration file.
//!
//! # Storage layout
//!
//! ```text
//! ~/.sprintsync/
//!   config.yaml        (mode 0600, created by `init`)
//!   snapshots/         (engine: append-only snapshot log)
//!   state/             (engine: sync state document)
//!   logs/, daemon.sock (daemon)
//! ```
//!
//! # API pattern
//!
//! Every function touching disk has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{CapacityPlan, CapacityProfile, CapacityUnit, SprintId, SprintState, TeamId};

pub const CONFIG_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// 1. Document
// ---------------------------------------------------------------------------

/// Where issues are fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Base URL of the tracker API; sprints are read from
    /// `<base_url>/sprints/<id>/issues`.
    pub base_url: String,
    /// Bearer token sent with every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            token: None,
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_http_timeout_secs() -> u64 {
    20
}

/// Refresh scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// Minimum time between two refreshes of the same sprint.
    pub interval_secs: u64,
    /// How often the scheduler looks for due sprints.
    pub tick_secs: u64,
    /// Worker pool size.
    pub workers: usize,
    /// Hard timeout for one fetch call.
    pub fetch_timeout_secs: u64,
    /// Fetch attempts per cycle, first attempt included.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Cooldown before a failed sprint returns to `pending`, doubled per
    /// consecutive error.
    pub cooldown_base_secs: u64,
    pub cooldown_max_secs: u64,
    /// An `in_progress` lease older than this is considered abandoned.
    pub lease_ttl_secs: u64,
    /// Closed sprints that ended longer ago than this are skipped.
    pub retention_days: u32,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval_secs: 6 * 60 * 60,
            tick_secs: 60,
            workers: 4,
            fetch_timeout_secs: 30,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
            cooldown_base_secs: 5 * 60,
            cooldown_max_secs: 6 * 60 * 60,
            lease_ttl_secs: 15 * 60,
            retention_days: 30,
        }
    }
}

impl RefreshSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

/// A sprint the scheduler keeps refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SprintEntry {
    pub id: SprintId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub state: SprintState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl SprintEntry {
    pub fn new(id: impl Into<SprintId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            state: SprintState::Active,
            ended_at: None,
        }
    }

    /// Closed sprint that ended before the retention window.
    pub fn outside_retention(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        match (self.state, self.ended_at) {
            (SprintState::Closed, Some(ended_at)) => now - ended_at > retention,
            _ => false,
        }
    }
}

/// A configured discipline team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamEntry {
    pub id: TeamId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Root of `~/.sprintsync/config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub refresh: RefreshSettings,
    #[serde(default)]
    pub capacity_unit: CapacityUnit,
    #[serde(default)]
    pub sprints: Vec<SprintEntry>,
    /// Team roster, in round-robin order.
    #[serde(default)]
    pub teams: Vec<TeamEntry>,
    /// Capacity profiles, maintained outside sprintsync.
    #[serde(default)]
    pub capacity: Vec<CapacityProfile>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            source: SourceSettings::default(),
            refresh: RefreshSettings::default(),
            capacity_unit: CapacityUnit::default(),
            sprints: vec![],
            teams: vec![],
            capacity: vec![],
        }
    }
}

impl Config {
    pub fn sprint(&self, id: &SprintId) -> Option<&SprintEntry> {
        self.sprints.iter().find(|s| &s.id == id)
    }

    /// Roster and profiles for the queue engine.
    pub fn capacity_plan(&self) -> CapacityPlan {
        CapacityPlan {
            unit: self.capacity_unit,
            roster: self.teams.iter().map(|t| t.id.clone()).collect(),
            profiles: self.capacity.clone(),
        }
    }

    /// Reject settings the scheduler cannot run with.
    ///
    /// Capacity profiles for unknown teams are NOT rejected here; the queue
    /// engine reports them when a queue is generated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh.workers == 0 {
            return Err(ConfigError::Invalid("refresh.workers must be at least 1".into()));
        }
        if self.refresh.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "refresh.max_attempts must be at least 1".into(),
            ));
        }
        if self.refresh.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "refresh.interval_secs must be positive".into(),
            ));
        }

        let mut seen = HashSet::new();
        for sprint in &self.sprints {
            if !seen.insert(&sprint.id) {
                return Err(ConfigError::Invalid(format!(
                    "sprint '{}' is listed twice",
                    sprint.id
                )));
            }
        }
        let mut seen = HashSet::new();
        for team in &self.teams {
            if !seen.insert(&team.id) {
                return Err(ConfigError::Invalid(format!(
                    "team '{}' is listed twice",
                    team.id
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 2. Paths
// ---------------------------------------------------------------------------

/// `<home>/.sprintsync/`: pure, no I/O.
pub fn root_at(home: &Path) -> PathBuf {
    home.join(".sprintsync")
}

/// `<home>/.sprintsync/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    root_at(home).join("config.yaml")
}

// ---------------------------------------------------------------------------
// 3. Load
// ---------------------------------------------------------------------------

/// Load and validate `<home>/.sprintsync/config.yaml`.
///
/// Returns `ConfigError::ConfigNotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Err(ConfigError::ConfigNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: Config =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Config, ConfigError> {
    load_at(&home()?)
}

// ---------------------------------------------------------------------------
// 4. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the config.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &Config) -> Result<(), ConfigError> {
    config.validate()?;
    let root = root_at(home);
    if !root.exists() {
        std::fs::create_dir_all(&root)?;
        set_dir_permissions(&root)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name("config.yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &Config) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// 5. Init
// ---------------------------------------------------------------------------

/// Create a default config if none exists.
///
/// Idempotent: an existing file is loaded and returned unchanged. The flag is
/// `true` when a new file was written.
pub fn init_at(home: &Path, base_url: Option<String>) -> Result<(Config, bool), ConfigError> {
    if config_path_at(home).exists() {
        return Ok((load_at(home)?, false));
    }
    let mut config = Config::default();
    if let Some(base_url) = base_url {
        config.source.base_url = base_url;
    }
    save_at(home, &config)?;
    Ok((config, true))
}

/// `init_at` convenience wrapper.
pub fn init(base_url: Option<String>) -> Result<(Config, bool), ConfigError> {
    init_at(&home()?, base_url)
}

// ---------------------------------------------------------------------------
// 6. Sprints
// ---------------------------------------------------------------------------

/// Track a sprint, or update the state/end date of one already tracked.
pub fn add_sprint_at(home: &Path, entry: SprintEntry) -> Result<Config, ConfigError> {
    let mut config = load_at(home)?;
    match config.sprints.iter_mut().find(|s| s.id == entry.id) {
        Some(existing) => {
            existing.state = entry.state;
            if entry.ended_at.is_some() {
                existing.ended_at = entry.ended_at;
            }
            if entry.name.is_some() {
                existing.name = entry.name;
            }
        }
        None => config.sprints.push(entry),
    }
    save_at(home, &config)?;
    Ok(config)
}

/// `add_sprint_at` convenience wrapper.
pub fn add_sprint(entry: SprintEntry) -> Result<Config, ConfigError> {
    add_sprint_at(&home()?, entry)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
