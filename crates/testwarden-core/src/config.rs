//! Configuration management for testwarden
//!
//! Loads `testwarden.toml` (explicit path or the per-user default location),
//! then applies `TESTWARDEN_*` environment overrides and validates the result.
//!
//! ```toml
//! [supervisor]
//! deadline_minutes = 5
//!
//! [watchdog]
//! build_run_max_age_secs = 30
//! test_host_max_age_secs = 300
//! max_wait_ms = 5000
//!
//! [cleanup]
//! interval_secs = 30
//! memory_threshold_percent = 85.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Environment variable overriding [`SupervisorConfig::deadline_minutes`].
pub const ENV_DEADLINE_MINUTES: &str = "TESTWARDEN_DEADLINE_MINUTES";
/// Environment variable overriding both watchdog age thresholds.
pub const ENV_WATCHDOG_AGE_SECS: &str = "TESTWARDEN_WATCHDOG_AGE_SECS";
/// Environment variable overriding [`WatchdogConfig::max_wait_ms`].
pub const ENV_WATCHDOG_WAIT_MS: &str = "TESTWARDEN_WATCHDOG_WAIT_MS";
/// Environment variable overriding [`CleanupConfig::memory_threshold_percent`].
pub const ENV_MEMORY_THRESHOLD: &str = "TESTWARDEN_MEMORY_THRESHOLD";
/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "TESTWARDEN_LOG_LEVEL";
/// Environment variable overriding the log format.
pub const ENV_LOG_FORMAT: &str = "TESTWARDEN_LOG_FORMAT";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for CI log capture
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging settings
    pub logging: LogConfig,
    /// Per-test-unit timeout supervision
    pub supervisor: SupervisorConfig,
    /// Orphan process watchdog
    pub watchdog: WatchdogConfig,
    /// Background cleanup scheduler
    pub cleanup: CleanupConfig,
    /// Resource disposal
    pub disposal: DisposalConfig,
}

/// Test-unit supervision settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Time budget for one test unit before forced teardown.
    pub deadline_minutes: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            deadline_minutes: 5,
        }
    }
}

impl SupervisorConfig {
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_minutes.saturating_mul(60))
    }
}

/// Orphan process watchdog settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Run sweeps at all (suite start/end and periodic).
    pub enabled: bool,
    /// Periodic sweep cadence; 0 disables the periodic sweeper only.
    pub interval_secs: u64,
    /// Age after which a leaked application build/run process is stale.
    pub build_run_max_age_secs: u64,
    /// Age after which a leaked test host process is stale.
    pub test_host_max_age_secs: u64,
    /// How long to wait for a terminated process to exit.
    pub max_wait_ms: u64,
    /// Command-line substrings identifying the application under test.
    pub app_markers: Vec<String>,
    /// Command-line substrings identifying test runner hosts.
    pub test_runner_markers: Vec<String>,
    /// Environment variable stamped on processes spawned by a test unit.
    pub unit_env_var: String,
    /// Never terminate ancestors of the current process.
    pub protect_ancestors: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            build_run_max_age_secs: 30,
            test_host_max_age_secs: 300,
            max_wait_ms: 5_000,
            app_markers: vec!["fleet-manager".to_string(), "fleetmanager".to_string()],
            test_runner_markers: vec!["testhost".to_string(), "--testwarden-unit".to_string()],
            unit_env_var: "TESTWARDEN_UNIT".to_string(),
            protect_ancestors: true,
        }
    }
}

impl WatchdogConfig {
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

/// Background cleanup scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Percent of system RAM in use above which a reclamation pass runs.
    pub memory_threshold_percent: f64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            memory_threshold_percent: 85.0,
        }
    }
}

/// Resource disposal settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DisposalConfig {
    /// Tree depth past which disposal logs a warning.
    pub max_depth: usize,
    /// How long a marshaled step may wait to start on its owning thread.
    pub marshal_timeout_ms: u64,
    /// Extra type-name substrings treated as grid-like.
    pub grid_markers: Vec<String>,
    /// Extra type-name substrings treated as list-like.
    pub list_markers: Vec<String>,
}

impl Default for DisposalConfig {
    fn default() -> Self {
        Self {
            max_depth: 64,
            marshal_timeout_ms: 5_000,
            grid_markers: Vec::new(),
            list_markers: Vec::new(),
        }
    }
}

impl DisposalConfig {
    #[must_use]
    pub fn marshal_timeout(&self) -> Duration {
        Duration::from_millis(self.marshal_timeout_ms)
    }
}

impl Config {
    /// Per-user default location (`<config_dir>/testwarden/testwarden.toml`).
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("testwarden").join("testwarden.toml"))
    }

    /// Load configuration, apply environment overrides and validate.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// used when present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::load_from(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without overrides or validation.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    /// Apply `TESTWARDEN_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_DEADLINE_MINUTES) {
            self.supervisor.deadline_minutes = parse_override(ENV_DEADLINE_MINUTES, &value)?;
        }
        if let Some(value) = lookup(ENV_WATCHDOG_AGE_SECS) {
            let secs: u64 = parse_override(ENV_WATCHDOG_AGE_SECS, &value)?;
            self.watchdog.build_run_max_age_secs = secs;
            self.watchdog.test_host_max_age_secs = secs;
        }
        if let Some(value) = lookup(ENV_WATCHDOG_WAIT_MS) {
            self.watchdog.max_wait_ms = parse_override(ENV_WATCHDOG_WAIT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_MEMORY_THRESHOLD) {
            self.cleanup.memory_threshold_percent =
                parse_override(ENV_MEMORY_THRESHOLD, &value)?;
        }
        if let Some(value) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = value;
        }
        if let Some(value) = lookup(ENV_LOG_FORMAT) {
            self.logging.format = value.parse().map_err(|reason| ConfigError::EnvOverride {
                var: ENV_LOG_FORMAT.to_string(),
                value: value.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Reject settings that would disable safety guarantees silently.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervisor.deadline_minutes == 0 {
            return Err(ConfigError::ValidationError(
                "supervisor.deadline_minutes must be greater than 0".to_string(),
            ));
        }
        if self.cleanup.enabled && self.cleanup.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "cleanup.interval_secs must be greater than 0 when cleanup is enabled".to_string(),
            ));
        }
        let threshold = self.cleanup.memory_threshold_percent;
        if !threshold.is_finite() || !(0.0..=100.0).contains(&threshold) {
            return Err(ConfigError::ValidationError(format!(
                "cleanup.memory_threshold_percent must be within 0-100, got {threshold}"
            )));
        }
        if self.disposal.max_depth == 0 {
            return Err(ConfigError::ValidationError(
                "disposal.max_depth must be greater than 0".to_string(),
            ));
        }
        if self.watchdog.unit_env_var.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "watchdog.unit_env_var must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_override<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::EnvOverride {
        var: var.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}
