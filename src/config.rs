//! Configuration types for region-dl

use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};
use url::Url;

use crate::error::{Error, Result};

/// Storage configuration (package directory, catalog, disk space policy)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding versioned package folders (default: "./maps")
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Region catalog file (default: "./countries.txt")
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,

    /// Bytes that must remain free after a download (default: 10 MB)
    #[serde(default = "default_safety_margin")]
    pub safety_margin_bytes: u64,

    /// Check free space before enqueueing downloads (default: true)
    #[serde(default = "default_true")]
    pub disk_space_check: bool,

    /// Persist the download queue across restarts (default: true)
    #[serde(default = "default_true")]
    pub persist_queue: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            catalog_path: default_catalog_path(),
            safety_margin_bytes: default_safety_margin(),
            disk_space_check: true,
            persist_queue: true,
        }
    }
}

/// HTTP transport configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Mirror base URLs, tried in order
    #[serde(default)]
    pub servers: Vec<Url>,

    /// Timeout for a single HTTP request (default: 60 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Minimum interval between progress reports (default: 250 ms)
    #[serde(default = "default_progress_interval", with = "duration_millis_serde")]
    pub progress_interval: Duration,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            request_timeout: default_request_timeout(),
            progress_interval: default_progress_interval(),
            user_agent: default_user_agent(),
        }
    }
}

/// Retry configuration for transient transport failures
///
/// Retries happen inside the transport. A download that still fails after
/// `max_attempts` is reported to the engine as failed and is never retried
/// automatically.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Event delivery configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventConfig {
    /// Capacity of the broadcast channel behind `subscribe_events` (default: 1000)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Main configuration for RegionDownloader
///
/// Fields are organized into sub-configs:
/// - [`storage`](StorageConfig): package directory, catalog file, disk space policy
/// - [`transport`](TransportConfig): mirrors and HTTP behavior
/// - [`retry`](RetryConfig): transport-level backoff
/// - [`events`](EventConfig): async event channel
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// HTTP transport settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Transport retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Event delivery settings
    #[serde(default)]
    pub events: EventConfig,
}

impl Config {
    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.events.channel_capacity == 0 {
            return Err(Error::Config {
                message: "event channel capacity must be greater than zero".into(),
                key: Some("events.channel_capacity".into()),
            });
        }
        if self.retry.backoff_multiplier <= 0.0 {
            return Err(Error::Config {
                message: "backoff multiplier must be positive".into(),
                key: Some("retry.backoff_multiplier".into()),
            });
        }
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(Error::Config {
                message: "data directory must not be empty".into(),
                key: Some("storage.data_dir".into()),
            });
        }
        Ok(())
    }

    /// Path of the persisted download queue
    pub fn queue_file(&self) -> PathBuf {
        self.storage.data_dir.join(QUEUE_FILE_NAME)
    }
}

pub(crate) const QUEUE_FILE_NAME: &str = "download_queue.json";

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("maps")
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("countries.txt")
}

fn default_safety_margin() -> u64 {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_user_agent() -> String {
    concat!("region-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_channel_capacity() -> usize {
    1000
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond variant for sub-second intervals
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
