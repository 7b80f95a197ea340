//! Configuration for schemashift components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default config file looked up in the working directory
const DEFAULT_CONFIG_FILE: &str = "schemashift.toml";

/// Env var pointing at an explicit config file
const CONFIG_PATH_ENV: &str = "SCHEMASHIFT_CONFIG";

/// Prefix for env overrides, e.g. `SCHEMASHIFT_ALTER__POLL_INTERVAL_MS=500`
const ENV_PREFIX: &str = "SCHEMASHIFT";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Alter job handling
    #[serde(default)]
    pub alter: AlterConfig,

    /// Metadata log
    #[serde(default)]
    pub journal: JournalConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alter: AlterConfig::default(),
            journal: JournalConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Alter handler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlterConfig {
    /// Period between two polls of the active jobs
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long FINISHED/CANCELLED jobs stay visible before being retired
    #[serde(default = "default_history_retention")]
    pub history_retention_secs: u64,

    /// Resolve the owning index by scanning when a finish mark carries no index id
    #[serde(default = "default_legacy_lookup")]
    pub legacy_report_index_lookup: bool,
}

fn default_poll_interval() -> u64 {
    1_000
}
fn default_history_retention() -> u64 {
    3 * 24 * 3600
}
fn default_legacy_lookup() -> bool {
    true
}

impl Default for AlterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            history_retention_secs: default_history_retention(),
            legacy_report_index_lookup: default_legacy_lookup(),
        }
    }
}

impl AlterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_secs)
    }
}

/// Metadata log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Path of the append-only edit log
    #[serde(default = "default_journal_path")]
    pub path: PathBuf,

    #[serde(default)]
    pub sync_policy: JournalSyncPolicy,
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("./meta/edit.log")
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: default_journal_path(),
            sync_policy: JournalSyncPolicy::default(),
        }
    }
}

/// When the edit log is flushed to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalSyncPolicy {
    /// fsync after every record
    #[default]
    Always,
    /// Flush the buffer, let the OS decide when to fsync
    Interval,
    /// Leave everything to the OS
    Never,
}

impl Config {
    /// Load config from `SCHEMASHIFT_CONFIG` or `./schemashift.toml` (both optional),
    /// then apply `SCHEMASHIFT_*` environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document (used by tests and tooling)
    pub fn from_toml(source: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.alter.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "alter.poll_interval_ms must be positive".into(),
            ));
        }
        if self.journal.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("journal.path cannot be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.alter.poll_interval_ms, 1_000);
        assert!(config.alter.legacy_report_index_lookup);
        assert_eq!(config.journal.sync_policy, JournalSyncPolicy::Always);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml(
            r#"
            log_level = "debug"

            [alter]
            poll_interval_ms = 250
            legacy_report_index_lookup = false

            [journal]
            path = "/tmp/edit.log"
            sync_policy = "never"
            "#,
        )
        .unwrap();

        assert_eq!(config.alter.poll_interval(), Duration::from_millis(250));
        assert!(!config.alter.legacy_report_index_lookup);
        assert_eq!(config.journal.sync_policy, JournalSyncPolicy::Never);
        assert_eq!(config.journal.path, PathBuf::from("/tmp/edit.log"));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let result = Config::from_toml("[alter]\npoll_interval_ms = 0\n");
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
