//! Configuration resolution for Offload.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/offload/settings.{json,toml})
//! 3. Project config (.offload/settings.{json,toml})
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binaries)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// File names probed inside each config directory, in order.
const SETTINGS_FILES: [&str; 2] = ["settings.json", "settings.toml"];

/// Complete Offload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub log_json: bool,
    /// Pools the registry may create lazily, keyed by pool name.
    pub pools: HashMap<String, PoolConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            pools: HashMap::new(),
        }
    }
}

/// One settings file. Settings it leaves out keep their value from the
/// layers below.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigLayer {
    log_level: Option<String>,
    log_json: Option<bool>,
    pools: HashMap<String, PoolConfig>,
}

/// Where a task's timeout budget starts counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAnchor {
    /// Counted from the moment a worker is assigned; queue wait is free.
    #[default]
    Dispatch,
    /// Counted from submission; a task may expire while still queued.
    Submission,
}

/// Per-pool configuration, fixed at the pool's creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub task_timeout_ms: u64,
    /// Worker program spawned for every worker unit.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout_anchor: TimeoutAnchor,
    /// Terminate and replace the worker of a timed-out task.
    pub replace_on_timeout: bool,
    /// Delay before retrying a failed worker spawn.
    pub respawn_backoff_ms: u64,
    /// Grace period between SIGTERM and SIGKILL when stopping a worker.
    pub terminate_grace_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            task_timeout_ms: 30_000,
            program: PathBuf::new(),
            args: Vec::new(),
            timeout_anchor: TimeoutAnchor::default(),
            replace_on_timeout: false,
            respawn_backoff_ms: 1_000,
            terminate_grace_ms: 5_000,
        }
    }
}

impl PoolConfig {
    /// Config for `program` with the given capacity and timeout.
    pub fn new(program: impl Into<PathBuf>, max_workers: usize, task_timeout: Duration) -> Self {
        Self {
            max_workers,
            task_timeout_ms: u64::try_from(task_timeout.as_millis()).unwrap_or(u64::MAX),
            program: program.into(),
            ..Self::default()
        }
    }

    pub const fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub const fn respawn_backoff(&self) -> Duration {
        Duration::from_millis(self.respawn_backoff_ms)
    }

    pub const fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Reject configurations a pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".into()));
        }
        if self.task_timeout_ms == 0 {
            return Err(Error::Config("task_timeout_ms must be positive".into()));
        }
        if self.program.as_os_str().is_empty() {
            return Err(Error::Config("program must name a worker executable".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_dir) = global_config_dir()
        && let Some(path) = find_settings_file(&global_dir)
    {
        let global = load_config_file(&path)?;
        merge_config(&mut config, global);
    }

    // Load project config
    if let Some(dir) = project_dir
        && let Some(path) = find_settings_file(&dir.join(".offload"))
    {
        let project = load_config_file(&path)?;
        merge_config(&mut config, project);
    }

    // Apply environment overrides
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load a single explicit config file, then apply environment overrides.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let mut config = Config::default();
    merge_config(&mut config, load_config_file(path)?);
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Get the global config directory path.
pub fn global_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".offload"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/offload"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("offload"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn find_settings_file(dir: &Path) -> Option<PathBuf> {
    SETTINGS_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

fn load_config_file(path: &Path) -> Result<ConfigLayer> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let parsed = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: ConfigLayer) {
    if let Some(level) = overlay.log_level {
        base.log_level = level;
    }
    if let Some(json) = overlay.log_json {
        base.log_json = json;
    }

    // Pools merge by name; a later layer replaces a pool wholesale.
    base.pools.extend(overlay.pools);
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("OFFLOAD_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Ok(val) = std::env::var("OFFLOAD_LOG_JSON") {
        if let Ok(flag) = val.parse() {
            config.log_json = flag;
        }
    }
}
