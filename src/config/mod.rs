//! Configuration layer: typed settings with layered precedence (file → env).

use std::{
    collections::HashMap,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::Path,
    str::FromStr,
};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheConfig, ResourceOverride};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "rescache";
const ENV_PREFIX: &str = "RESCACHE";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub refresh_page_size: NonZeroUsize,
    pub refresh_page_pause_ms: u64,
    pub drain_batch_size: NonZeroUsize,
    pub drain_pause_ms: u64,
    pub distributed_lock_ttl_secs: NonZeroU64,
    pub expired_throttle_secs: u64,
    pub follower_wait_ms: u64,
    pub max_request_ids: NonZeroUsize,
    pub max_page_limit: NonZeroUsize,
    pub change_queue_capacity: NonZeroUsize,
    pub change_batch_limit: NonZeroUsize,
    pub cond_queue_capacity: NonZeroUsize,
    pub max_non_all_conditions: usize,
    pub cond_retry_attempts: NonZeroU32,
    pub cond_retry_backoff_ms: u64,
    pub resources: HashMap<String, ResourceOverride>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (files → environment).
///
/// `config/default.*` and `rescache.*` are optional; an explicit `file` must
/// exist. Environment variables look like `RESCACHE__CACHE__REFRESH_PAGE_SIZE`.
pub fn load(file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    for (name, over) in &cache.resources {
        if let (Some(min), Some(max)) = (over.jitter_min_secs, over.jitter_max_secs) {
            if min > max {
                return Err(LoadError::invalid(
                    "cache.resources",
                    format!("jitter_min_secs exceeds jitter_max_secs for `{name}`"),
                ));
            }
        }
        if over.ttl_secs == Some(0) {
            return Err(LoadError::invalid(
                "cache.resources",
                format!("ttl_secs must be greater than zero for `{name}`"),
            ));
        }
    }

    let cond_retry_attempts = non_zero_u32(
        cache
            .cond_retry_attempts
            .unwrap_or(u64::from(defaults.cond_retry_attempts)),
        "cache.cond_retry_attempts",
    )?;
    let distributed_lock_ttl_secs = NonZeroU64::new(
        cache
            .distributed_lock_ttl_secs
            .unwrap_or(defaults.distributed_lock_ttl_secs),
    )
    .ok_or_else(|| LoadError::invalid("cache.distributed_lock_ttl_secs", "must be greater than zero"))?;

    Ok(CacheSettings {
        refresh_page_size: non_zero_usize(
            cache.refresh_page_size.unwrap_or(defaults.refresh_page_size),
            "cache.refresh_page_size",
        )?,
        refresh_page_pause_ms: cache
            .refresh_page_pause_ms
            .unwrap_or(defaults.refresh_page_pause_ms),
        drain_batch_size: non_zero_usize(
            cache.drain_batch_size.unwrap_or(defaults.drain_batch_size),
            "cache.drain_batch_size",
        )?,
        drain_pause_ms: cache.drain_pause_ms.unwrap_or(defaults.drain_pause_ms),
        distributed_lock_ttl_secs,
        expired_throttle_secs: cache
            .expired_throttle_secs
            .unwrap_or(defaults.expired_throttle_secs),
        follower_wait_ms: cache.follower_wait_ms.unwrap_or(defaults.follower_wait_ms),
        max_request_ids: non_zero_usize(
            cache.max_request_ids.unwrap_or(defaults.max_request_ids),
            "cache.max_request_ids",
        )?,
        max_page_limit: non_zero_usize(
            cache.max_page_limit.unwrap_or(defaults.max_page_limit),
            "cache.max_page_limit",
        )?,
        change_queue_capacity: non_zero_usize(
            cache
                .change_queue_capacity
                .unwrap_or(defaults.change_queue_capacity),
            "cache.change_queue_capacity",
        )?,
        change_batch_limit: non_zero_usize(
            cache.change_batch_limit.unwrap_or(defaults.change_batch_limit),
            "cache.change_batch_limit",
        )?,
        cond_queue_capacity: non_zero_usize(
            cache
                .cond_queue_capacity
                .unwrap_or(defaults.cond_queue_capacity),
            "cache.cond_queue_capacity",
        )?,
        max_non_all_conditions: cache
            .max_non_all_conditions
            .unwrap_or(defaults.max_non_all_conditions),
        cond_retry_attempts,
        cond_retry_backoff_ms: cache
            .cond_retry_backoff_ms
            .unwrap_or(defaults.cond_retry_backoff_ms),
        resources: cache.resources,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    refresh_page_size: Option<usize>,
    refresh_page_pause_ms: Option<u64>,
    drain_batch_size: Option<usize>,
    drain_pause_ms: Option<u64>,
    distributed_lock_ttl_secs: Option<u64>,
    expired_throttle_secs: Option<u64>,
    follower_wait_ms: Option<u64>,
    max_request_ids: Option<usize>,
    max_page_limit: Option<usize>,
    change_queue_capacity: Option<usize>,
    change_batch_limit: Option<usize>,
    cond_queue_capacity: Option<usize>,
    max_non_all_conditions: Option<usize>,
    cond_retry_attempts: Option<u64>,
    cond_retry_backoff_ms: Option<u64>,
    resources: HashMap<String, ResourceOverride>,
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
