use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DupemapError, Result};

/// Main configuration structure for dupemap
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DupemapConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Metadata cache settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Cache file location (default: ~/.cache/dupemap/metadata_cache.json)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Entries older than this are treated as absent
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,

    /// Minimum time between two non-forced flushes
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,

    /// Minimum time between two expiry sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Request batching and retry policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts per batch and per individual fallback fetch
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Constant delay between whole-batch attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Base of the exponential delay between individual attempts
    #[serde(default = "default_item_base_delay_ms")]
    pub item_base_delay_ms: u64,
}

/// Remote drive endpoint settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_batch_url")]
    pub batch_url: String,

    /// Bearer token; falls back to DUPEMAP_ACCESS_TOKEN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// File whose contents identify the account for cache fingerprinting
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ttl_hours() -> u64 {
    24
}

fn default_save_interval_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_batch_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_item_base_delay_ms() -> u64 {
    1000
}

fn default_api_base() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}

fn default_batch_url() -> String {
    "https://www.googleapis.com/batch/drive/v3".to_string()
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_page_size() -> u32 {
    1000
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            ttl_hours: default_ttl_hours(),
            save_interval_secs: default_save_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            item_base_delay_ms: default_item_base_delay_ms(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            batch_url: default_batch_url(),
            access_token: None,
            credentials_path: default_credentials_path(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl DupemapConfig {
    /// Load config from custom path or default XDG location
    pub fn load(custom_path: Option<&PathBuf>) -> Result<Self> {
        let path = if let Some(p) = custom_path {
            p.clone()
        } else {
            match Self::default_config_path() {
                Ok(p) => p,
                Err(_) => return Ok(Self::default()),
            }
        };

        if !path.exists() {
            if custom_path.is_some() {
                return Err(DupemapError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path)
            .map_err(|e| DupemapError::ConfigIo(path.clone(), e))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| DupemapError::ConfigParse(path.clone(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Get default config path: ~/.config/dupemap/config.toml
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(DupemapError::NoConfigDir)?;

        Ok(config_dir.join("dupemap").join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch.batch_size == 0 {
            return Err(DupemapError::Config("batch.batch_size must be at least 1".into()));
        }
        if self.batch.max_retries == 0 {
            return Err(DupemapError::Config("batch.max_retries must be at least 1".into()));
        }
        if self.cache.ttl_hours == 0 {
            return Err(DupemapError::Config("cache.ttl_hours must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolved cache file path: explicit setting, else the platform cache dir.
    pub fn cache_path(&self) -> PathBuf {
        if let Some(path) = &self.cache.path {
            return path.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("dupemap")
            .join("metadata_cache.json")
    }

    /// Token from config, then from the environment.
    pub fn access_token(&self) -> Option<String> {
        self.remote
            .access_token
            .clone()
            .or_else(|| std::env::var("DUPEMAP_ACCESS_TOKEN").ok())
            .filter(|t| !t.trim().is_empty())
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            ttl: Duration::from_secs(self.cache.ttl_hours * 3600),
            save_interval: Duration::from_secs(self.cache.save_interval_secs),
            sweep_interval: Duration::from_secs(self.cache.sweep_interval_secs),
        }
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            batch_size: self.batch.batch_size.max(1),
            max_retries: self.batch.max_retries.max(1),
            retry_delay: Duration::from_millis(self.batch.retry_delay_ms),
            item_base_delay: Duration::from_millis(self.batch.item_base_delay_ms),
        }
    }
}

/// Resolved timing knobs handed to the cache store.
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub save_interval: Duration,
    pub sweep_interval: Duration,
}

/// Resolved batching knobs handed to the multiplexer and gateway.
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub item_base_delay: Duration,
}

impl BatchSettings {
    /// Delay before individual attempt `attempt + 1`: base * 2^(attempt - 1).
    pub fn item_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.item_base_delay.saturating_mul(1u32 << exp)
    }
}
