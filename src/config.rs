use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub broadcast: BroadcastConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/netwarden/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("netwarden/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.general.db_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Address whose traffic is classified and attributed in rankings
    #[serde(default = "default_monitored_host")]
    pub monitored_host: String,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            monitored_host: default_monitored_host(),
            db_path: default_db_path(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Unacknowledged messages the queue hands out at once
    #[serde(default = "default_batch_size")]
    pub prefetch: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Partial batches are flushed after this many seconds
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,
}

impl QueueConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            prefetch: default_batch_size(),
            batch_size: default_batch_size(),
            batch_timeout_secs: default_batch_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_classifier_url")]
    pub url: String,

    #[serde(default = "default_classifier_timeout")]
    pub timeout_secs: u64,
}

impl ClassifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            url: default_classifier_url(),
            timeout_secs: default_classifier_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Period of the aggregate snapshot broadcast
    #[serde(default = "default_broadcast_interval")]
    pub interval_secs: u64,
}

impl BroadcastConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_broadcast_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Events between persistence flushes
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            flush_threshold: default_flush_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_monitored_host() -> String {
    "127.0.0.1".to_string()
}

fn default_db_path() -> String {
    "/var/lib/netwarden/netwarden.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_name() -> String {
    "packets".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_timeout() -> u64 {
    1
}

fn default_classifier_url() -> String {
    "http://127.0.0.1:8500/predict".to_string()
}

fn default_classifier_timeout() -> u64 {
    10
}

fn default_broadcast_interval() -> u64 {
    1
}

fn default_flush_threshold() -> u64 {
    crate::stats::DEFAULT_FLUSH_THRESHOLD
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
