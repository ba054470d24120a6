//! Engine configuration.
//!
//! Priority: environment > `meridian.json` > defaults. A missing or
//! malformed file is logged and defaults are used; an out-of-range value
//! is an error.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::EngineError;

/// File name looked up in the repository root when no path is given.
pub const CONFIG_FILE_NAME: &str = "meridian.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub watch: WatchSettings,
    pub coupling: CouplingSettings,
    pub vcs: VcsSettings,
    pub storage: StorageSettings,
    pub query: QuerySettings,
    pub discovery: DiscoverySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    /// Debounce window for filesystem bursts
    pub debounce_ms: u64,
    /// Interval between global refreshes while files are dirty
    pub global_interval_secs: u64,
    pub gitignore_aware: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            global_interval_secs: 30,
            gitignore_aware: true,
        }
    }
}

impl WatchSettings {
    pub fn global_interval(&self) -> Duration {
        Duration::from_secs(self.global_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CouplingSettings {
    pub lookback_months: u32,
    /// Commits touching more files than this are discarded
    pub max_files_per_commit: usize,
    pub min_strength: f64,
    pub min_co_changes: u32,
}

impl Default for CouplingSettings {
    fn default() -> Self {
        Self {
            lookback_months: 6,
            max_files_per_commit: 50,
            min_strength: 0.3,
            min_co_changes: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VcsSettings {
    pub timeout_secs: u64,
}

impl Default for VcsSettings {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl VcsSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Write failures tolerated inside one mutation unit
    pub failure_threshold: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Hard cap on traversal depth, whatever the caller asks for
    pub max_depth: usize,
    pub default_depth: usize,
    pub max_rows: usize,
    pub max_statement_len: usize,
    pub max_cell_len: usize,
    pub max_search_limit: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            max_depth: 10,
            default_depth: 3,
            max_rows: 500,
            max_statement_len: 4096,
            max_cell_len: 2000,
            max_search_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl EngineConfig {
    /// Load `meridian.json` under `root` (if present) and apply `MERIDIAN_*`
    /// environment overrides.
    pub fn load(root: &Path) -> Result<Self> {
        Self::from_file_and_env(Some(&root.join(CONFIG_FILE_NAME)))
    }

    pub fn from_file_and_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_file(path),
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file. Returns defaults on any failure.
    fn load_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::debug!("No config file at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Apply overrides from a key lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T> {
            raw.trim().parse::<T>().map_err(|_| {
                EngineError::Config(format!("{} must be a number, got {:?}", key, raw)).into()
            })
        }

        if let Some(raw) = lookup("MERIDIAN_DEBOUNCE_MS") {
            self.watch.debounce_ms = parse("MERIDIAN_DEBOUNCE_MS", raw)?;
        }
        if let Some(raw) = lookup("MERIDIAN_GLOBAL_INTERVAL_SECS") {
            self.watch.global_interval_secs = parse("MERIDIAN_GLOBAL_INTERVAL_SECS", raw)?;
        }
        if let Some(raw) = lookup("MERIDIAN_COUPLING_LOOKBACK_MONTHS") {
            self.coupling.lookback_months = parse("MERIDIAN_COUPLING_LOOKBACK_MONTHS", raw)?;
        }
        if let Some(raw) = lookup("MERIDIAN_VCS_TIMEOUT_SECS") {
            self.vcs.timeout_secs = parse("MERIDIAN_VCS_TIMEOUT_SECS", raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&self.coupling.min_strength) {
            return Err(EngineError::Config(format!(
                "coupling.min_strength must be within [0, 1], got {}",
                self.coupling.min_strength
            )));
        }
        if self.query.max_depth == 0 {
            return Err(EngineError::Config("query.max_depth must be at least 1".into()));
        }
        if self.vcs.timeout_secs == 0 {
            return Err(EngineError::Config("vcs.timeout_secs must be at least 1".into()));
        }
        Ok(())
    }
}
