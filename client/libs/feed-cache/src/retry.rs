//! Retry policy for query fetches
//!
//! Only transient failures (see [`FeedCacheError::is_retryable`]) are retried.
//! Mutations never pass through here; a failed optimistic write rolls back
//! instead.
//!
//! [`FeedCacheError::is_retryable`]: crate::FeedCacheError::is_retryable

use crate::error::Result;
use crate::keys::QueryKey;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Spread each delay by up to 30% either way
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Single attempt
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Reads that render above the fold: two quick retries
    pub fn interactive() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based), capped at `max_backoff`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let growth = self
            .backoff_multiplier
            .powi(retry.saturating_sub(1) as i32);
        let capped = (self.initial_backoff.as_millis() as f64 * growth)
            .min(self.max_backoff.as_millis() as f64);

        let millis = if self.jitter {
            capped * rand::thread_rng().gen_range(0.7..1.3)
        } else {
            capped
        };
        Duration::from_millis(millis as u64)
    }
}

/// Run `fetch` until it succeeds, fails permanently or runs out of retries.
/// The last error is returned unchanged.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, key: &QueryKey, mut fetch: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;

    loop {
        let error = match fetch().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !error.is_retryable() || retries >= config.max_retries {
            if retries > 0 {
                warn!(key = %key, attempts = retries + 1, error = %error, "Giving up on fetch");
            }
            return Err(error);
        }

        retries += 1;
        let delay = config.delay_for(retries);
        debug!(
            key = %key,
            retry = retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying fetch"
        );
        tokio::time::sleep(delay).await;
    }
}
