//! Configuration management for the backup archiver.
//!
//! Loads configuration from a TOML file; `BACKUP_ARCHIVER_ROOT` (from the
//! environment or a `.env` file) overrides the archive root.

use crate::retention::RetentionPolicy;
use crate::utils::errors::{ArchiveError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ROOT_ENV_VAR: &str = "BACKUP_ARCHIVER_ROOT";

/// Upper bound for retention counts, far beyond any real rotation.
pub const MAX_RETENTION_COUNT: usize = 100_000;

/// Upper bound for `max_archive_hours`, one year.
pub const MAX_ARCHIVE_HOURS: u64 = 24 * 365;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub archive: ArchiveConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub log: LogConfig,
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Directory holding one archive directory per backup
    pub root: PathBuf,

    /// External tool used to unpack `.tar` payloads
    #[serde(default = "default_tar_command")]
    pub tar_command: String,

    /// Archiving one backup for longer than this suggests a conflicting run
    #[serde(default = "default_max_archive_hours")]
    pub max_archive_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(flatten)]
    pub backend: BackendConfig,

    /// Attempts per download, including the first one
    #[serde(default = "default_download_attempts")]
    pub download_attempts: usize,

    /// Delay between download attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Delete-then-relist rounds during remote cleanup
    #[serde(default = "default_delete_rounds")]
    pub delete_rounds: usize,
}

/// Where the uploaded backups live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        path: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },
    Gcs {
        bucket: String,
    },
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Claim each backup with a remote lease record before archiving it
    #[serde(default = "default_lease_enabled")]
    pub enabled: bool,

    /// Host part of the lease owner, defaults to the host name. Every run
    /// appends its own id, see [`crate::archiver::lease::process_owner`].
    #[serde(default = "default_owner")]
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One family of backups sharing a name prefix and a retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub prefix: String,

    #[serde(flatten)]
    pub retention: RetentionPolicy,
}

// Default values
fn default_tar_command() -> String {
    "tar".to_string()
}

fn default_max_archive_hours() -> u64 {
    24
}

fn default_download_attempts() -> usize {
    10
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_delete_rounds() -> usize {
    10
}

fn default_lease_enabled() -> bool {
    true
}

fn default_owner() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "backup-archiver".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            enabled: default_lease_enabled(),
            owner: default_owner(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ArchiveConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_archive_hours.saturating_mul(3600))
    }
}

impl RemoteConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl GroupConfig {
    fn validate_retention(&self) -> Result<()> {
        let counts = match self.retention {
            RetentionPolicy::Full {
                daily_count,
                monthly_count,
            } => vec![("daily_count", daily_count), ("monthly_count", monthly_count)],
            RetentionPolicy::Incremental { day_count } => vec![("day_count", day_count)],
        };
        for (field, count) in counts {
            if count > MAX_RETENTION_COUNT {
                return Err(ArchiveError::Config(format!(
                    "group {:?}: {} must be at most {}",
                    self.prefix, field, MAX_RETENTION_COUNT
                )));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file, apply environment overrides and
    /// validate it
    pub fn from_file(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;
        if let Ok(root) = std::env::var(ROOT_ENV_VAR) {
            if !root.is_empty() {
                config.archive.root = PathBuf::from(root);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ArchiveError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(ArchiveError::Config("at least one [[groups]] entry is required".into()));
        }

        let mut seen = HashSet::new();
        for group in &self.groups {
            if group.prefix.is_empty() {
                return Err(ArchiveError::Config("group prefix must not be empty".into()));
            }
            if group.prefix.contains('/') {
                return Err(ArchiveError::Config(format!(
                    "group prefix {:?} must not contain '/'",
                    group.prefix
                )));
            }
            if !seen.insert(group.prefix.as_str()) {
                return Err(ArchiveError::Config(format!(
                    "group prefix {:?} is configured twice",
                    group.prefix
                )));
            }
            group.validate_retention()?;
        }

        if self.remote.download_attempts == 0 {
            return Err(ArchiveError::Config("remote.download_attempts must be at least 1".into()));
        }
        if self.remote.delete_rounds == 0 {
            return Err(ArchiveError::Config("remote.delete_rounds must be at least 1".into()));
        }
        if !(1..=MAX_ARCHIVE_HOURS).contains(&self.archive.max_archive_hours) {
            return Err(ArchiveError::Config(format!(
                "archive.max_archive_hours must be between 1 and {}",
                MAX_ARCHIVE_HOURS
            )));
        }

        Ok(())
    }
}
