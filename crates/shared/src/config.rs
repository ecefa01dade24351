//! Configuration management for the anime metadata fetchers.
//!
//! This module handles loading and parsing configuration from TOML files,
//! with sensible defaults for all settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
///
/// Every section and every field inside one may be left out; missing values
/// take the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory settings
    pub data: DataConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Shared retry settings for every upstream
    pub fetch: FetchConfig,

    /// Per-upstream settings
    pub providers: ProvidersConfig,

    /// Raw response cache settings
    pub cache: CacheConfig,
}

/// Data directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root data directory path
    pub root_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log directory path (relative to data directory or absolute)
    pub log_dir: String,

    /// Default log level (trace, debug, info, warn, error)
    pub default_level: String,

    /// Enable console output
    pub console: bool,

    /// Enable file output
    pub file: bool,

    /// Enable JSON formatting for file logs
    pub json_format: bool,
}

/// Retry behaviour of the fetch loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Attempts per URL, including the first one
    pub max_retries: u32,

    /// Base retry delay in milliseconds
    pub retry_delay_ms: u64,

    /// Linear multiplier applied together with the attempt number
    pub retry_multiplier: u32,

    /// Fixed cooldown after a soft-ban response, in seconds
    pub soft_ban_cooldown_secs: u64,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,

    /// User agent sent with every request
    pub user_agent: String,

    /// Number of ids processed concurrently against one upstream
    pub workers: usize,
}

/// Settings for every supported upstream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub jikan: JikanConfig,
    pub shikimori: ShikimoriConfig,
    pub anidb: AniDbConfig,
    pub anime365: Anime365Config,
}

/// Jikan (MyAnimeList) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JikanConfig {
    /// API base URL
    pub base_url: String,

    /// Rate limiting settings
    pub rate_limit: RateLimitConfig,
}

/// Shikimori settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShikimoriConfig {
    pub base_url: String,
    pub rate_limit: RateLimitConfig,
}

/// AniDB additionally needs a registered client name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AniDbConfig {
    pub base_url: String,
    pub rate_limit: RateLimitConfig,

    /// Registered HTTP API client name
    pub client: String,

    /// Registered HTTP API client version
    pub client_version: u32,
}

/// Anime365 series catalogue, walked by offset
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Anime365Config {
    pub base_url: String,
    pub rate_limit: RateLimitConfig,

    /// Series requested per page
    pub page_size: u32,

    /// Offset of the first page, for resuming an interrupted walk
    pub start_offset: u32,
}

/// How the per-minute history is emptied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurstWindowMode {
    /// Whole history is dropped on every fixed window boundary
    #[default]
    FixedFlush,
    /// Each admission expires one window after it was recorded
    Sliding,
}

/// Rate limiting configuration
///
/// A `rate_limit` table that is present but incomplete takes the missing
/// fields from [`RateLimitConfig::default`] (1/s, 60/min), not from the
/// provider's own preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    pub requests_per_second: u32,

    /// Maximum requests per minute
    pub requests_per_minute: u32,

    /// Minimum spacing in milliseconds; overrides `requests_per_second`
    /// for upstreams slower than one request per second
    pub min_interval_ms: Option<u64>,

    /// Burst window behaviour
    pub window_mode: BurstWindowMode,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable storing raw responses
    pub enabled: bool,

    /// Raw response directory (relative to data directory)
    pub raw_dir: String,
}

impl RateLimitConfig {
    fn per_second(requests_per_second: u32, requests_per_minute: u32) -> Self {
        Self {
            requests_per_second,
            requests_per_minute,
            min_interval_ms: None,
            window_mode: BurstWindowMode::FixedFlush,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_second(1, 60)
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root_dir: "data".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            default_level: "info".to_string(),
            console: true,
            file: true,
            json_format: false,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 10_000,
            retry_multiplier: 2,
            soft_ban_cooldown_secs: 300,
            request_timeout_secs: 30,
            user_agent: "anime-db-aggregator/0.1.0".to_string(),
            workers: 1,
        }
    }
}

impl Default for JikanConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.jikan.moe/v4".to_string(),
            rate_limit: RateLimitConfig::per_second(3, 60),
        }
    }
}

impl Default for ShikimoriConfig {
    fn default() -> Self {
        Self {
            base_url: "https://shikimori.one/api".to_string(),
            rate_limit: RateLimitConfig::per_second(3, 70),
        }
    }
}

impl Default for AniDbConfig {
    fn default() -> Self {
        Self {
            base_url: "http://api.anidb.net:9001/httpapi".to_string(),
            rate_limit: RateLimitConfig {
                min_interval_ms: Some(5_000),
                ..RateLimitConfig::per_second(1, 12)
            },
            client: "ichimetvos".to_string(),
            client_version: 2,
        }
    }
}

impl Default for Anime365Config {
    fn default() -> Self {
        Self {
            base_url: "https://smotret-anime.online/api".to_string(),
            rate_limit: RateLimitConfig::per_second(2, 60),
            page_size: 500,
            start_offset: 0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            raw_dir: "raw".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            "Configuration saved successfully"
        );

        Ok(())
    }

    /// Get the absolute path for the data directory
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data.root_dir)
    }

    /// Get the absolute path for the log directory
    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.logging.log_dir)
    }

    /// Get the absolute path for the raw response directory
    pub fn raw_dir(&self) -> PathBuf {
        self.resolve(&self.cache.raw_dir)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }
}
