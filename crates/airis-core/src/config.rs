//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/airis/config.toml)
//! 3. Environment variables (AIRIS_* prefix)
//!
//! Environment variables take precedence over config file values.
//!
//! Every tunable of the store (retry budget, quota threshold, cache
//! capacity, batch size) lives here with its default rather than being
//! hardcoded at the call site.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "AIRIS";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (SQLite database)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the remote sync API (optional)
    #[serde(default)]
    pub sync_url: Option<String>,

    /// Whether sync is enabled
    #[serde(default)]
    pub sync_enabled: bool,

    /// Bearer token sent to the remote API
    #[serde(default)]
    pub sync_token: Option<String>,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub quota: QuotaSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub limits: LimitSettings,
}

/// Sync scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Seconds between timer-triggered sync cycles
    pub interval_secs: u64,
    /// Maximum number of local mutations pushed per cycle
    pub batch_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            batch_size: 50,
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Retry with exponential backoff for remote calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per remote call (first try included)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay_ms: u64,
    /// Factor applied to the delay after every failed attempt
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
        }
    }
}

/// Per operation class timeouts for remote calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub default_ms: u64,
    pub sync_ms: u64,
    pub upload_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            default_ms: 10_000,
            sync_ms: 20_000,
            upload_ms: 60_000,
        }
    }
}

/// Storage quota monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    /// Fraction of the quota above which storage counts as nearly full
    pub warning_threshold: f64,
    /// Local storage budget for the data directory, in megabytes
    pub local_quota_mb: u64,
    /// Seconds between periodic quota checks
    pub check_interval_secs: u64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            warning_threshold: 0.9,
            local_quota_mb: 500,
            check_interval_secs: 60,
        }
    }
}

impl QuotaSettings {
    pub fn local_quota_bytes(&self) -> u64 {
        self.local_quota_mb * 1024 * 1024
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// AI summary cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum number of cached summaries
    pub capacity: usize,
    /// Lifetime applied to summaries admitted without an expiry
    pub ttl_secs: u64,
    /// Seconds between background sweeps of expired entries
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Entity size limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Largest accepted book file, in bytes
    pub max_file_size: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync_url: None,
            sync_enabled: false,
            sync_token: None,
            sync: SyncSettings::default(),
            retry: RetrySettings::default(),
            timeouts: TimeoutSettings::default(),
            quota: QuotaSettings::default(),
            cache: CacheSettings::default(),
            limits: LimitSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (AIRIS_DATA_DIR, AIRIS_SYNC_URL, AIRIS_SYNC_ENABLED, AIRIS_SYNC_TOKEN)
    /// 2. Config file (~/.config/airis/config.toml or AIRIS_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Configuration rooted at `data_dir` with every other value defaulted
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // AIRIS_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // AIRIS_SYNC_URL
        if let Ok(val) = std::env::var(format!("{}_SYNC_URL", ENV_PREFIX)) {
            self.sync_url = if val.is_empty() { None } else { Some(val) };
        }

        // AIRIS_SYNC_ENABLED
        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        // AIRIS_SYNC_TOKEN
        if let Ok(val) = std::env::var(format!("{}_SYNC_TOKEN", ENV_PREFIX)) {
            self.sync_token = if val.is_empty() { None } else { Some(val) };
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with AIRIS_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("airis")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("airis.db")
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("airis")
}
