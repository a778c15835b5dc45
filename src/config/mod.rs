//! Configuration loading.
//!
//! Configuration is read from `~/.config/almanac/config.toml`. If the file
//! doesn't exist, a default configuration with comments is created.

pub mod source;

pub use source::{SourceEntry, SourceKindName};

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::bridge::BridgeConfig;
use crate::domain::SourceConfig;
use crate::fetcher::FetchConfig;
use crate::parser::{ParserConfig, MAX_WINDOW_DAYS};
use crate::store::StoreConfig;
use crate::sync::SyncConfig;

/// Main configuration struct.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub fetch: FetchConfig,
    pub parser: ParserConfig,
    pub bridge: BridgeConfig,
    pub sources: Vec<SourceEntry>,
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, creates a default one with comments.
    /// Missing fields in the config file use default values.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_config(&config_path)?;
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path: `~/.config/almanac/config.toml`
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("almanac").join("config.toml"))
    }

    /// Resolved database path: `store.path` if set, else the platform data dir.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(ref path) = self.store.path {
            return Ok(PathBuf::from(expand(path)?));
        }
        let data_dir = dirs::data_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(data_dir.join("almanac").join("almanac.db"))
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.workers == 0 {
            return Err(ConfigError::Invalid("sync.workers must be at least 1".into()));
        }
        if self.sync.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_attempts must be at least 1".into(),
            ));
        }
        if self.fetch.max_connections == 0 || self.fetch.max_connections_per_host == 0 {
            return Err(ConfigError::Invalid(
                "fetch connection limits must be at least 1".into(),
            ));
        }
        if self.fetch.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "fetch.failure_threshold must be at least 1".into(),
            ));
        }
        if self.parser.past_days > MAX_WINDOW_DAYS || self.parser.future_days > MAX_WINDOW_DAYS {
            return Err(ConfigError::Invalid(format!(
                "parser.past_days and parser.future_days must be at most {}",
                MAX_WINDOW_DAYS
            )));
        }
        if self.parser.default_timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "parser.default_timezone '{}' is not an IANA time zone",
                self.parser.default_timezone
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &self.sources {
            if !seen.insert(entry.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source id '{}'",
                    entry.id
                )));
            }
        }
        self.source_configs().map(|_| ())
    }

    /// Resolve source entries into the engine's read-only source definitions.
    pub fn source_configs(&self) -> Result<Vec<SourceConfig>, ConfigError> {
        self.sources.iter().map(SourceEntry::resolve).collect()
    }

    fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut file = fs::File::create(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        file.write_all(Self::default_config_content().as_bytes())
            .map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;

        Ok(())
    }

    /// Generate the default config file content with comments.
    fn default_config_content() -> String {
        r##"# Almanac configuration
#
# Values in `url`, `path`, auth secrets and `store.path` may reference
# environment variables ("$HOME", "${CAL_TOKEN}") and "~".

[store]
# Database location (default: platform data dir, almanac/almanac.db)
# path = "~/.local/share/almanac/almanac.db"

# Keep the raw ICS body next to the event batch it produced
retain_raw = false

# Number of sync run records kept for diagnostics
run_history = 50

[sync]
# Sources synchronized in parallel
workers = 4

# Attempts per source for transient fetch failures
max_attempts = 3
initial_backoff_ms = 500
max_backoff_ms = 8000

# "full_replace" drops rows no longer in the feed; "incremental_merge" only upserts
mode = "full_replace"

[fetch]
connect_timeout_secs = 10
read_timeout_secs = 30
write_timeout_secs = 15
deadline_secs = 60
max_body_bytes = 10485760
max_connections = 32
max_connections_per_host = 4
pool_idle_per_host = 4

# Circuit breaker: open after this many consecutive failures, probe after cooldown
failure_threshold = 3
cooldown_secs = 300

[parser]
# Recurrence expansion window around the fetch time
past_days = 30
future_days = 180
max_occurrences = 1000

# Zone for floating times when the feed declares none
default_timezone = "UTC"

[bridge]
deadline_secs = 30
worker_threads = 2

# [[sources]]
# id = "work"
# kind = "ics"          # ics | webcal | file
# url = "https://example.com/calendar.ics"
# ttl_secs = 3600
#
# [sources.auth]
# mode = "bearer"       # none | basic | bearer
# token = "${WORK_CAL_TOKEN}"
"##
        .to_string()
    }
}

/// Expand `~` and environment variables in a configuration string.
pub(crate) fn expand(value: &str) -> Result<String, ConfigError> {
    shellexpand::full(value)
        .map(|v| v.into_owned())
        .map_err(|e| ConfigError::Invalid(format!("cannot expand '{}': {}", value, e)))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read/write config file at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
