use sha2::{Digest, Sha256};
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use crate::{config::Config, models::retry::RetryConfig};

/// Stable, cache-key-safe identifier for a delivery destination.
///
/// Raw URLs and phone numbers never end up in cache keys or metric labels.
pub fn destination_key(destination: &str) -> String {
    let digest = Sha256::digest(destination.as_bytes());
    hex::encode(&digest[..8])
}

impl RetryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.connect_retry_attempts,
            initial_delay_ms: config.connect_retry_initial_delay_ms,
            max_delay_ms: config.connect_retry_max_delay_ms,
            backoff_multiplier: config.connect_retry_backoff_multiplier,
        }
    }
}

pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt >= config.max_attempts => {
                warn!(
                    max_attempts = config.max_attempts,
                    error = %e,
                    "Giving up after exhausting retry attempts"
                );
                return Err(e);
            }
            Err(e) => {
                let jitter = rand::random_range(-0.1..=0.1);
                let jittered_delay = (delay_ms as f64 * (1.0 + jitter)) as u64;

                debug!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = jittered_delay,
                    error = %e,
                    "Attempt failed, backing off"
                );

                sleep(Duration::from_millis(jittered_delay)).await;

                delay_ms = delay_ms
                    .saturating_mul(config.backoff_multiplier)
                    .min(config.max_delay_ms);
            }
        }
    }
}
