//! Configuration management for the Magelink sync engine
//!
//! Handles server configuration, database location, cron job definitions, log level
//! toggles and write retry parameters. Defaults come from `MAGELINK_*` environment
//! variables; a JSON file can override everything.

use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ops HTTP server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Cron scheduler configuration
    pub cron: CronConfig,
    /// Log service configuration
    pub logging: LoggingConfig,
    /// Write retry and retention parameters
    pub sync: SyncConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file (default: "data/magelink.db")
    pub path: String,
}

/// Cron scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// Directory holding one lock file per job
    pub lock_dir: String,
    /// Operator notification webhook; notifications only go to the log when unset
    pub notify_url: Option<String>,
    /// Jobs in evaluation order
    pub jobs: Vec<CronJobConfig>,
}

/// Schedule and locking parameters for one named job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronJobConfig {
    /// Unique job name, also the job kind ("synchronizer", "retrieval", "logclear")
    pub name: String,
    /// Run every `interval` minutes
    pub interval: u32,
    /// Minute offset within the interval
    #[serde(default)]
    pub offset: u32,
    /// Minutes before an admin may force-release the lock; derived when unset
    #[serde(default)]
    pub lock_time: Option<u32>,
    /// Re-run a job flagged overdue as soon as its lock disappears
    #[serde(default = "default_true")]
    pub overdue: bool,
    /// Multiplier used to derive `lock_time` from `interval`
    #[serde(default = "default_lock_multiplier")]
    pub auto_lock_multiplier: u32,
    /// Notify the operator once the lock is older than this many intervals
    #[serde(default = "default_notify_intervals")]
    pub notify_after_intervals: u32,
}

fn default_true() -> bool {
    true
}

fn default_lock_multiplier() -> u32 {
    4
}

fn default_notify_intervals() -> u32 {
    3
}

impl CronJobConfig {
    pub fn new(name: &str, interval: u32, offset: u32) -> Self {
        Self {
            name: name.to_string(),
            interval,
            offset,
            lock_time: None,
            overdue: true,
            auto_lock_multiplier: default_lock_multiplier(),
            notify_after_intervals: default_notify_intervals(),
        }
    }

    /// Effective lock time in minutes
    pub fn lock_time(&self) -> u32 {
        self.lock_time
            .unwrap_or_else(|| self.interval.saturating_mul(self.auto_lock_multiplier))
    }

    pub fn interval_seconds(&self) -> i64 {
        i64::from(self.interval) * 60
    }
}

/// Log service configuration: each level is toggled independently
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Levels that are persisted to the `log_entry` table
    pub enabled_levels: Vec<LogLevel>,
}

/// Write retry and retention parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts per single-row write
    pub write_attempts: u32,
    /// Linear backoff base in milliseconds (attempt N sleeps N × base)
    pub write_backoff_ms: u64,
    /// LogClear retention window in days
    pub log_retention_days: u32,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            cron: CronConfig::default(),
            logging: LoggingConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("MAGELINK_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("MAGELINK_PORT")
                .unwrap_or_else(|_| "3010".to_string())
                .parse()
                .unwrap_or(3010),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: std::env::var("MAGELINK_DB")
                .unwrap_or_else(|_| "data/magelink.db".to_string()),
        }
    }
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            lock_dir: std::env::var("MAGELINK_LOCK_DIR")
                .unwrap_or_else(|_| "data/locks".to_string()),
            notify_url: std::env::var("MAGELINK_NOTIFY_URL").ok(),
            jobs: vec![
                CronJobConfig::new("synchronizer", 1, 0),
                CronJobConfig::new("retrieval", 30, 0),
                CronJobConfig::new("logclear", 1440, 120),
            ],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled_levels: vec![LogLevel::Error, LogLevel::Warn, LogLevel::Info],
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            write_attempts: 5,
            write_backoff_ms: 200,
            log_retention_days: std::env::var("MAGELINK_LOG_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file; missing sections keep their defaults
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config '{}': {}", path.display(), e))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid config '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject job definitions the scheduler cannot evaluate
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for job in &self.cron.jobs {
            if job.interval == 0 {
                anyhow::bail!("Cron job '{}' has a zero interval", job.name);
            }
            if job.offset >= job.interval {
                anyhow::bail!(
                    "Cron job '{}' offset {} must be below its interval {}",
                    job.name,
                    job.offset,
                    job.interval
                );
            }
            if !seen.insert(job.name.as_str()) {
                anyhow::bail!("Cron job '{}' is defined twice", job.name);
            }
        }
        Ok(())
    }
}
