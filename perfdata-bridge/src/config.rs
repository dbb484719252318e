//! Service configuration
//!
//! Loaded from a TOML file whose path comes from `PERFDATA_BRIDGE_CONFIG`
//! (default `perfdata-bridge.toml`). Every key is optional:
//!
//! ```toml
//! spool_directory = "/var/spool/gnocchi-nagios/ready"
//! workers = 4
//! interval_delay_secs = 15
//!
//! [store]
//! endpoint = "http://gnocchi:8041"
//! username = "admin"
//! ```

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "PERFDATA_BRIDGE_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "perfdata-bridge.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Directory where nagios/icinga writes its perfdata files
    pub spool_directory: PathBuf,
    /// Number of processor workers
    pub workers: usize,
    /// Number of files handed to a worker in one work item
    pub file_per_worker_pass: usize,
    /// Marker appended to a file name when a worker claims it
    pub file_picked_suffix: String,
    /// Seconds between two spool scans
    pub interval_delay_secs: u64,
    /// Put back files left claimed by a crashed worker instead of deleting them
    pub resubmit_on_crash: bool,
    /// Replaces `/` in resource and metric names
    pub slash_replacement: String,
    /// Metric names are built as `<service><delim><perfdata name>`
    pub metric_delim: String,
    pub queue_capacity: usize,
    pub dequeue_timeout_secs: u64,
    pub log_level: String,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub endpoint: String,
    /// Sent as HTTP basic user when set
    pub username: Option<String>,
    pub resource_type: String,
    pub archive_policy_name: Option<String>,
    pub create_metrics: bool,
    pub cache_ttl_secs: u64,
    pub connect_retry_initial_ms: u64,
    pub connect_retry_max_secs: u64,
    pub connect_retry_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            spool_directory: PathBuf::from("/var/spool/gnocchi-nagios/ready"),
            workers: default_workers(),
            file_per_worker_pass: 100,
            file_picked_suffix: "-processed-by-worker-".to_string(),
            interval_delay_secs: 15,
            resubmit_on_crash: false,
            slash_replacement: "@".to_string(),
            metric_delim: "::".to_string(),
            queue_capacity: 64,
            dequeue_timeout_secs: 10,
            log_level: "info".to_string(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8041".to_string(),
            username: None,
            resource_type: "nagios-service".to_string(),
            archive_policy_name: None,
            create_metrics: true,
            cache_ttl_secs: 3600,
            connect_retry_initial_ms: 1000,
            connect_retry_max_secs: 10,
            connect_retry_attempts: 8,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl BridgeConfig {
    /// Config file named by `PERFDATA_BRIDGE_CONFIG`, else `perfdata-bridge.toml`.
    pub fn config_path() -> PathBuf {
        config_path_or_default(std::env::var_os(CONFIG_ENV))
    }

    /// Loads the config at `path`, or defaults if the file is absent.
    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "no config file, using defaults");
            return Self::default().validated();
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml(&content).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.file_per_worker_pass == 0 {
            return Err(invalid("file_per_worker_pass", "must be at least 1"));
        }
        if self.dequeue_timeout_secs == 0 {
            return Err(invalid("dequeue_timeout_secs", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.file_picked_suffix.is_empty() {
            return Err(invalid("file_picked_suffix", "must not be empty"));
        }
        if self.slash_replacement.contains('/') {
            return Err(invalid("slash_replacement", "must not contain '/'"));
        }
        if self.store.endpoint.trim().is_empty() {
            return Err(invalid("store.endpoint", "must not be empty"));
        }
        Ok(self)
    }

    pub fn interval_delay(&self) -> Duration {
        Duration::from_secs(self.interval_delay_secs)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_secs)
    }
}

fn config_path_or_default(value: Option<OsString>) -> PathBuf {
    value
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}
