use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{tlog_debug, Error, Result};

/// Environment variable that overrides the storage root.
pub const ROOT_ENV: &str = "TROUPE_HOME";

/// Directory name that marks a project root when walking up from the cwd.
pub const PROJECT_MARKER: &str = ".troupe";

/// Default time without a heartbeat before an active agent counts a miss.
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 60;

/// Default number of consecutive misses before an agent is marked inactive.
pub const DEFAULT_GRACE_MISSES: u32 = 2;

/// Default period of the stale sweep.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Default cap on nested dispatch evaluations.
pub const DEFAULT_MAX_DISPATCH_DEPTH: usize = 5;

/// Process-wide tunables, read from `<root>/config.toml`.
///
/// Every field is optional in the file; missing fields take the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub stale_threshold_secs: u64,
    pub grace_misses: u32,
    pub sweep_interval_secs: u64,
    pub max_dispatch_depth: usize,
    /// Bounded wait for lock acquisition. `None` blocks indefinitely.
    pub lock_timeout_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stale_threshold_secs: DEFAULT_STALE_THRESHOLD_SECS,
            grace_misses: DEFAULT_GRACE_MISSES,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_dispatch_depth: DEFAULT_MAX_DISPATCH_DEPTH,
            lock_timeout_ms: None,
        }
    }
}

impl Config {
    /// Resolve the storage root.
    ///
    /// `TROUPE_HOME` wins; otherwise the nearest ancestor of the working
    /// directory containing a `.troupe` directory; otherwise `~/.troupe`.
    pub fn resolve_root() -> Result<PathBuf> {
        if let Ok(root) = std::env::var(ROOT_ENV) {
            if !root.trim().is_empty() {
                tlog_debug!("Config::resolve_root from {}={}", ROOT_ENV, root);
                return Ok(expand_tilde(&root));
            }
        }

        let cwd = std::env::current_dir()?;
        if let Some(root) = find_project_root(&cwd) {
            tlog_debug!("Config::resolve_root found marker at {}", root.display());
            return Ok(root);
        }

        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(PROJECT_MARKER))
    }

    pub fn config_path(root: &Path) -> PathBuf {
        root.join("config.toml")
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::config_path(root);
        tlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            tlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        tlog_debug!("Config loaded: {:?}", config);
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        if !root.exists() {
            fs::create_dir_all(root)?;
        }
        let path = Self::config_path(root);
        fs::write(&path, toml::to_string_pretty(self)?)?;
        tlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

/// Walk up from `start` to the first directory containing `.troupe`,
/// returning the marker directory itself.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_MARKER))
        .find(|candidate| candidate.is_dir())
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
