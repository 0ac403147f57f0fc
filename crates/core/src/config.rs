//! Configuration (smartq.toml + SMARTQ_* env overrides).

use std::collections::BTreeMap;
use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::job::{CPU_UNITS, MEMORY_MB};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "smartq.toml";

/// Error raised when the configuration cannot be assembled.
#[derive(Debug, thiserror::Error)]
#[error("Configuration error: {0}")]
pub struct ConfigError(String);

/// Top-level config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartqConfig {
    /// Job store location
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Total capacity per resource dimension
    #[serde(default = "default_resources")]
    pub resources: BTreeMap<String, u64>,

    /// Scheduling loop tunables
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for SmartqConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            resources: default_resources(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Store selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite://…` URL, or `memory` for the in-process store
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

impl DatabaseConfig {
    /// Whether the in-process store was requested.
    pub fn is_memory(&self) -> bool {
        self.url.eq_ignore_ascii_case("memory")
    }
}

/// What happens to a pending job whose dependency can no longer succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyFailurePolicy {
    /// Leave it pending until an operator cancels it
    #[default]
    Wait,
    /// Cancel it on the next cycle that observes the failed dependency
    Cancel,
}

/// Scheduling loop tunables. Durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Idle sleep between selection passes
    pub tick_interval_secs: u64,
    /// Size of the candidate short list per pass
    pub scan_limit: usize,
    /// Execution slots per engine
    pub max_concurrent: usize,
    /// Deadline for jobs without `timeout_seconds`
    pub default_timeout_secs: u64,
    /// Attempts for jobs without `retry.max_attempts`
    pub default_max_attempts: u32,
    /// Multiplier for jobs without `retry.backoff_multiplier`
    pub default_backoff_multiplier: f64,
    /// Delay before the first retry
    pub base_retry_delay_secs: u64,
    /// Upper bound on any retry delay
    pub max_retry_delay_secs: u64,
    /// Time a timed-out body gets to observe cancellation
    pub cancel_grace_secs: u64,
    /// Run time of simulated work when the payload sets none
    pub simulated_duration_secs: f64,
    /// Handling of permanently failed dependencies
    pub dependency_failure: DependencyFailurePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            scan_limit: 10,
            max_concurrent: 1,
            default_timeout_secs: 300,
            default_max_attempts: 1,
            default_backoff_multiplier: 2.0,
            base_retry_delay_secs: 5,
            max_retry_delay_secs: 3600,
            cancel_grace_secs: 5,
            simulated_duration_secs: 10.0,
            dependency_failure: DependencyFailurePolicy::Wait,
        }
    }
}

fn default_database_url() -> String {
    "sqlite://smartq.db?mode=rwc".to_string()
}

fn default_resources() -> BTreeMap<String, u64> {
    BTreeMap::from([(CPU_UNITS.to_string(), 8), (MEMORY_MB.to_string(), 4096)])
}

impl SmartqConfig {
    /// Load config from a TOML file with `SMARTQ_*` env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `SMARTQ_SCHEDULER__MAX_CONCURRENT=4`. A missing file is not an error.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Self::figment(path)
            .merge(Env::prefixed("SMARTQ_").split("__"))
            .extract()
            .map_err(|e| ConfigError(e.to_string()))
    }

    /// Defaults merged with the TOML file only.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::figment(path)
            .extract()
            .map_err(|e| ConfigError(e.to_string()))
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(SmartqConfig::default())).merge(Toml::file(path))
    }
}
