use std::{env, time::Duration};

use crm_directory::HttpDirectoryClientConfig;
use crm_directory::client::{DEFAULT_BASE_URL, DEFAULT_PAGE_SIZE};
use thiserror::Error;

use crate::sync::{DrainConfig, RefreshPolicy, ResyncConfig};

pub const DEFAULT_QUEUE_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
    pub page_size: u32,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: None,
            timeout: Duration::from_secs(30),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub db_url: Option<String>,
    pub directory: DirectoryConfig,
    pub drain: DrainConfig,
    pub refresh: RefreshPolicy,
    pub resync: ResyncConfig,
    pub queue_max_attempts: u32,
    pub resync_on_empty_cache: bool,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: None,
            directory: DirectoryConfig::default(),
            drain: DrainConfig::default(),
            refresh: RefreshPolicy::default(),
            resync: ResyncConfig::default(),
            queue_max_attempts: DEFAULT_QUEUE_MAX_ATTEMPTS,
            resync_on_empty_cache: true,
            log_format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid directory setting: {0}")]
    InvalidDirectoryConfig(String),
    #[error("invalid drain setting: {0}")]
    InvalidDrainConfig(String),
    #[error("invalid refresh setting: {0}")]
    InvalidRefreshConfig(String),
    #[error("invalid resync setting: {0}")]
    InvalidResyncConfig(String),
    #[error("invalid CRM_BRIDGE_QUEUE_MAX_ATTEMPTS: {0}")]
    InvalidQueueMaxAttempts(String),
    #[error("invalid CRM_BRIDGE_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let db_url = lookup("DB_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Ok(Self {
            db_url,
            directory: parse_directory_config(&lookup)?,
            drain: parse_drain_config(&lookup)?,
            refresh: parse_refresh_policy(&lookup)?,
            resync: parse_resync_config(&lookup)?,
            queue_max_attempts: parse_u64_lookup(
                &lookup,
                "CRM_BRIDGE_QUEUE_MAX_ATTEMPTS",
                u64::from(defaults.queue_max_attempts),
                1,
                100,
                ConfigError::InvalidQueueMaxAttempts,
            )? as u32,
            resync_on_empty_cache: parse_bool_lookup(
                &lookup,
                "CRM_BRIDGE_RESYNC_ON_EMPTY_CACHE",
                defaults.resync_on_empty_cache,
            )
            .map_err(ConfigError::InvalidResyncConfig)?,
            log_format: parse_with_lookup(
                &lookup,
                "CRM_BRIDGE_LOG_FORMAT",
                defaults.log_format,
                |raw| match raw.trim().to_ascii_lowercase().as_str() {
                    "json" => Ok(LogFormat::Json),
                    "pretty" | "text" => Ok(LogFormat::Pretty),
                    other => Err(ConfigError::InvalidLogFormat(other.to_string())),
                },
            )?,
        })
    }

    /// HTTP client settings, when an API token is configured.
    pub fn http_directory_config(&self) -> Option<HttpDirectoryClientConfig> {
        self.directory
            .api_token
            .clone()
            .map(|api_token| HttpDirectoryClientConfig {
                base_url: self.directory.base_url.clone(),
                api_token,
                timeout: self.directory.timeout,
                page_size: self.directory.page_size,
            })
    }
}

fn parse_directory_config(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<DirectoryConfig, ConfigError> {
    let defaults = DirectoryConfig::default();
    let base_url = lookup("CRM_DIRECTORY_BASE_URL")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or(defaults.base_url);
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::InvalidDirectoryConfig(format!(
            "CRM_DIRECTORY_BASE_URL: unsupported url {base_url}"
        )));
    }
    let api_token = lookup("CRM_DIRECTORY_API_TOKEN")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let timeout_ms = parse_u64_lookup(
        lookup,
        "CRM_DIRECTORY_TIMEOUT_MS",
        defaults.timeout.as_millis() as u64,
        100,
        300_000,
        ConfigError::InvalidDirectoryConfig,
    )?;
    let page_size = parse_u64_lookup(
        lookup,
        "CRM_BRIDGE_RESYNC_PAGE_SIZE",
        u64::from(defaults.page_size),
        1,
        10_000,
        ConfigError::InvalidResyncConfig,
    )?;

    Ok(DirectoryConfig {
        base_url,
        api_token,
        timeout: Duration::from_millis(timeout_ms),
        page_size: page_size as u32,
    })
}

fn parse_drain_config(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<DrainConfig, ConfigError> {
    let defaults = DrainConfig::default();
    let interval_seconds = parse_u64_lookup(
        lookup,
        "CRM_BRIDGE_DRAIN_INTERVAL_SECONDS",
        defaults.interval.as_secs(),
        1,
        86_400,
        ConfigError::InvalidDrainConfig,
    )?;
    let batch_size = parse_u64_lookup(
        lookup,
        "CRM_BRIDGE_DRAIN_BATCH_SIZE",
        defaults.batch_size as u64,
        1,
        100,
        ConfigError::InvalidDrainConfig,
    )?;
    let lease_seconds = parse_u64_lookup(
        lookup,
        "CRM_BRIDGE_QUEUE_LEASE_SECONDS",
        defaults.lease.as_secs(),
        10,
        86_400,
        ConfigError::InvalidDrainConfig,
    )?;

    Ok(DrainConfig {
        interval: Duration::from_secs(interval_seconds),
        batch_size: batch_size as usize,
        lease: Duration::from_secs(lease_seconds),
    })
}

fn parse_refresh_policy(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<RefreshPolicy, ConfigError> {
    let defaults = RefreshPolicy::default();
    let interval_seconds = parse_u64_lookup(
        lookup,
        "CRM_BRIDGE_REFRESH_INTERVAL_SECONDS",
        defaults.interval.as_secs(),
        1,
        86_400,
        ConfigError::InvalidRefreshConfig,
    )?;
    let stale_after_seconds = parse_u64_lookup(
        lookup,
        "CRM_BRIDGE_STALE_AFTER_SECONDS",
        defaults.stale_after.as_secs(),
        60,
        30 * 86_400,
        ConfigError::InvalidRefreshConfig,
    )?;
    let large_batch = parse_u64_lookup(
        lookup,
        "CRM_BRIDGE_REFRESH_LARGE_BATCH",
        defaults.large_batch as u64,
        1,
        1_000,
        ConfigError::InvalidRefreshConfig,
    )?;
    let small_batch = parse_u64_lookup(
        lookup,
        "CRM_BRIDGE_REFRESH_SMALL_BATCH",
        defaults.small_batch as u64,
        1,
        1_000,
        ConfigError::InvalidRefreshConfig,
    )?;
    if small_batch > large_batch {
        return Err(ConfigError::InvalidRefreshConfig(format!(
            "CRM_BRIDGE_REFRESH_SMALL_BATCH ({small_batch}) exceeds CRM_BRIDGE_REFRESH_LARGE_BATCH ({large_batch})"
        )));
    }
    let bulk_threshold = parse_u64_lookup(
        lookup,
        "CRM_BRIDGE_REFRESH_BULK_THRESHOLD",
        defaults.bulk_threshold,
        1,
        u64::MAX,
        ConfigError::InvalidRefreshConfig,
    )?;
    let request_delay_ms = parse_u64_lookup(
        lookup,
        "CRM_BRIDGE_REFRESH_REQUEST_DELAY_MS",
        defaults.request_delay.as_millis() as u64,
        0,
        60_000,
        ConfigError::InvalidRefreshConfig,
    )?;
    let max_backoff_seconds = parse_u64_lookup(
        lookup,
        "CRM_BRIDGE_REFRESH_MAX_BACKOFF_SECONDS",
        defaults.max_backoff.as_secs(),
        1,
        86_400,
        ConfigError::InvalidRefreshConfig,
    )?;

    Ok(RefreshPolicy {
        interval: Duration::from_secs(interval_seconds),
        stale_after: Duration::from_secs(stale_after_seconds),
        large_batch: large_batch as usize,
        small_batch: small_batch as usize,
        bulk_threshold,
        request_delay: Duration::from_millis(request_delay_ms),
        max_backoff: Duration::from_secs(max_backoff_seconds.max(interval_seconds)),
    })
}

fn parse_resync_config(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<ResyncConfig, ConfigError> {
    let defaults = ResyncConfig::default();
    let max_pages = parse_u64_lookup(
        lookup,
        "CRM_BRIDGE_RESYNC_MAX_PAGES",
        u64::from(defaults.max_pages),
        1,
        10_000,
        ConfigError::InvalidResyncConfig,
    )?;
    Ok(ResyncConfig {
        max_pages: max_pages as u32,
        ..defaults
    })
}

fn parse_u64_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
    error: fn(String) -> ConfigError,
) -> Result<u64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        raw.trim()
            .parse::<u64>()
            .map_err(|parse_error| error(format!("{key}: {parse_error}")))
            .map(|value| value.clamp(min, max))
    })
}

fn parse_bool_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, String> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(format!("{key}: {other}")),
        },
    }
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key).filter(|raw| !raw.trim().is_empty()) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}
