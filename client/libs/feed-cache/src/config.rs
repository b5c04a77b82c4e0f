use crate::retry::RetryConfig;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix, e.g. `FEED_CACHE_STALE_TIME_MS`
pub const ENV_PREFIX: &str = "FEED_CACHE_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tuning knobs for the cache, executor, coordinator and composer
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Age after which a cached value is refetched on next read
    pub stale_time: Duration,
    /// Inactivity window after which unobserved entries are evicted
    pub gc_time: Duration,
    pub page_size: usize,
    /// Sponsored item inserted after every N primary items
    pub sponsored_interval: usize,
    /// Longest accepted post/comment body, in characters
    pub max_body_len: usize,
    /// Refetch observed stale entries right after a mutation settles
    pub refetch_on_settle: bool,
    pub retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_millis(default_stale_time_ms()),
            gc_time: Duration::from_millis(default_gc_time_ms()),
            page_size: default_page_size(),
            sponsored_interval: default_sponsored_interval(),
            max_body_len: default_max_body_len(),
            refetch_on_settle: true,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EnvConfig {
    #[serde(default = "default_stale_time_ms")]
    stale_time_ms: u64,
    #[serde(default = "default_gc_time_ms")]
    gc_time_ms: u64,
    #[serde(default = "default_page_size")]
    page_size: usize,
    #[serde(default = "default_sponsored_interval")]
    sponsored_interval: usize,
    #[serde(default = "default_max_body_len")]
    max_body_len: usize,
    #[serde(default = "default_true")]
    refetch_on_settle: bool,
    #[serde(default = "default_retry_max")]
    retry_max: u32,
    #[serde(default = "default_retry_backoff_ms")]
    retry_backoff_ms: u64,
}

impl CacheConfig {
    /// Load from `FEED_CACHE_*` variables (and `.env` when present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let env: EnvConfig = envy::prefixed(ENV_PREFIX).from_env()?;

        let config = CacheConfig {
            stale_time: Duration::from_millis(env.stale_time_ms),
            gc_time: Duration::from_millis(env.gc_time_ms),
            page_size: env.page_size,
            sponsored_interval: env.sponsored_interval,
            max_body_len: env.max_body_len,
            refetch_on_settle: env.refetch_on_settle,
            retry: RetryConfig {
                max_retries: env.retry_max,
                initial_backoff: Duration::from_millis(env.retry_backoff_ms),
                ..RetryConfig::default()
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be positive".into()));
        }
        if self.sponsored_interval == 0 {
            return Err(ConfigError::Invalid(
                "sponsored_interval must be positive".into(),
            ));
        }
        if self.max_body_len == 0 {
            return Err(ConfigError::Invalid("max_body_len must be positive".into()));
        }
        Ok(())
    }
}

fn default_stale_time_ms() -> u64 {
    60_000
}

fn default_gc_time_ms() -> u64 {
    300_000
}

fn default_page_size() -> usize {
    10
}

fn default_sponsored_interval() -> usize {
    5
}

fn default_max_body_len() -> usize {
    2_000
}

fn default_true() -> bool {
    true
}

fn default_retry_max() -> u32 {
    RetryConfig::default().max_retries
}

fn default_retry_backoff_ms() -> u64 {
    RetryConfig::default().initial_backoff.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 4] = [
        "FEED_CACHE_STALE_TIME_MS",
        "FEED_CACHE_PAGE_SIZE",
        "FEED_CACHE_REFETCH_ON_SETTLE",
        "FEED_CACHE_SPONSORED_INTERVAL",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_when_unset() {
        clear_env();
        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.sponsored_interval, 5);
    }

    #[test]
    #[serial]
    fn test_overrides_from_env() {
        clear_env();
        std::env::set_var("FEED_CACHE_STALE_TIME_MS", "1500");
        std::env::set_var("FEED_CACHE_PAGE_SIZE", "25");
        std::env::set_var("FEED_CACHE_REFETCH_ON_SETTLE", "false");

        let config = CacheConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.stale_time, Duration::from_millis(1500));
        assert_eq!(config.page_size, 25);
        assert!(!config.refetch_on_settle);
    }

    #[test]
    #[serial]
    fn test_invalid_values_rejected() {
        clear_env();
        std::env::set_var("FEED_CACHE_SPONSORED_INTERVAL", "0");
        let result = CacheConfig::from_env();
        clear_env();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        std::env::set_var("FEED_CACHE_PAGE_SIZE", "lots");
        let result = CacheConfig::from_env();
        clear_env();
        assert!(matches!(result, Err(ConfigError::Env(_))));
    }
}
