//! Configuration management for pulsedb
//!
//! Handles loading and validation of `pulsedb.toml`. Every field has a
//! default, so an empty or absent file is a valid configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::retry::RetryPolicy;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, colored
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,

    /// Queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Store retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Debounce settings
    #[serde(default)]
    pub pulse: PulseConfig,
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum records the main queue holds when it is created
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Appended to the main queue name to name the backup queue
    #[serde(default = "default_backup_suffix")]
    pub backup_suffix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            backup_suffix: default_backup_suffix(),
        }
    }
}

fn default_capacity() -> usize {
    4096
}

fn default_backup_suffix() -> String {
    "~".to_string()
}

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("pulsedb.sqlite3")
}

/// Retry configuration for store calls. Store calls never give up, so
/// there is no attempt limit here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default)]
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter_percent: 0.0,
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    256_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl RetryConfig {
    /// Build the unbounded store retry policy.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_factor,
            self.jitter_percent,
            None,
        )
    }
}

/// Debounce configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseConfig {
    /// Shortest on or off phase that counts as real, in microseconds
    #[serde(default = "default_min_pulse_us")]
    pub min_pulse_us: u64,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            min_pulse_us: default_min_pulse_us(),
        }
    }
}

fn default_min_pulse_us() -> u64 {
    50_000
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ReadFailed(path.display().to_string(), e.to_string())
        })?;
        Self::from_toml(&text)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.queue.capacity == 0 {
            return Err(invalid("queue.capacity must be at least 1"));
        }
        if self.queue.backup_suffix.is_empty() {
            return Err(invalid("queue.backup_suffix must not be empty"));
        }
        if self.queue.backup_suffix.contains('/') {
            return Err(invalid("queue.backup_suffix must not contain '/'"));
        }
        if self.pulse.min_pulse_us == 0 {
            return Err(invalid("pulse.min_pulse_us must be at least 1"));
        }
        if self.retry.initial_delay_ms == 0 {
            return Err(invalid("retry.initial_delay_ms must be at least 1"));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(invalid(
                "retry.max_delay_ms must not be below retry.initial_delay_ms",
            ));
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(invalid("retry.backoff_factor must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_percent) {
            return Err(invalid("retry.jitter_percent must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// Debounce threshold as a duration.
    #[must_use]
    pub fn min_pulse(&self) -> Duration {
        Duration::from_micros(self.pulse.min_pulse_us)
    }
}

fn invalid(message: &str) -> crate::Error {
    ConfigError::ValidationError(message.to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.capacity, 4096);
        assert_eq!(config.queue.backup_suffix, "~");
        assert_eq!(config.pulse.min_pulse_us, 50_000);
        assert_eq!(config.min_pulse(), Duration::from_millis(50));
    }

    #[test]
    fn empty_file_uses_defaults() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [log]
            level = "debug"
            format = "json"

            [pulse]
            min_pulse_us = 20000

            [retry]
            max_delay_ms = 8000
            "#,
        )
        .unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.pulse.min_pulse_us, 20_000);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert_eq!(config.retry.max_delay_ms, 8_000);
        assert_eq!(config.queue.capacity, 4096);
    }

    #[test]
    fn retry_policy_from_defaults_matches_store_preset() {
        assert_eq!(RetryConfig::default().policy(), RetryPolicy::store());
    }

    #[test]
    fn validation_rejects_zero_capacity() {
        let err = Config::from_toml("[queue]\ncapacity = 0\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::ValidationError(ref msg)) if msg.contains("capacity")
        ));
    }

    #[test]
    fn validation_rejects_inverted_retry_bounds() {
        let err =
            Config::from_toml("[retry]\ninitial_delay_ms = 5000\nmax_delay_ms = 10\n").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ValidationError(_))));
    }

    #[test]
    fn validation_rejects_zero_debounce_and_slash_suffix() {
        assert!(Config::from_toml("[pulse]\nmin_pulse_us = 0\n").is_err());
        assert!(Config::from_toml("[queue]\nbackup_suffix = \"/x\"\n").is_err());
    }

    #[test]
    fn parse_errors_are_reported() {
        let err = Config::from_toml("[queue\n").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ParseFailed(_))));
    }

    #[test]
    fn load_from_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ReadFailed(_, _))));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulsedb.toml");
        std::fs::write(&path, "[store]\npath = \"/var/lib/pulsedb/pulses.db\"\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(
            config.store.path,
            PathBuf::from("/var/lib/pulsedb/pulses.db")
        );
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
