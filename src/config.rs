use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    clients::webhook::SigningSecrets,
    dispatcher::DispatcherConfig,
    models::{circuit_breaker::CircuitBreakerConfig, retry::BackoffSchedule},
};

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,

    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    #[serde(default = "default_retry_backoff_seconds")]
    pub retry_backoff_seconds: String,
    #[serde(default = "default_delivery_timeout_seconds")]
    pub delivery_timeout_seconds: u64,
    #[serde(default)]
    pub dead_letter_permanent_failures: bool,

    #[serde(default = "default_circuit_breaker_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_circuit_breaker_cooldown_seconds")]
    pub circuit_breaker_cooldown_seconds: u64,

    #[serde(default)]
    pub webhook_signing_secret: Option<String>,
    #[serde(default)]
    pub webhook_named_secrets: Option<String>,
    #[serde(default = "default_signature_max_skew_seconds")]
    pub signature_max_skew_seconds: u64,

    #[serde(default)]
    pub egress_allowed_hosts: String,
    #[serde(default)]
    pub egress_denied_cidrs: String,
    #[serde(default)]
    pub egress_allow_private: bool,

    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    #[serde(default = "default_connect_retry_attempts")]
    pub connect_retry_attempts: u32,
    #[serde(default = "default_connect_retry_initial_delay_ms")]
    pub connect_retry_initial_delay_ms: u64,
    #[serde(default = "default_connect_retry_max_delay_ms")]
    pub connect_retry_max_delay_ms: u64,
    #[serde(default = "default_connect_retry_backoff_multiplier")]
    pub connect_retry_backoff_multiplier: u64,
}

fn default_poll_interval_seconds() -> u64 {
    5
}

fn default_max_delivery_attempts() -> u32 {
    5
}

fn default_batch_size() -> usize {
    100
}

fn default_lease_seconds() -> u64 {
    60
}

fn default_retry_backoff_seconds() -> String {
    "60,300,1800".to_string()
}

fn default_delivery_timeout_seconds() -> u64 {
    5
}

fn default_circuit_breaker_failure_threshold() -> u32 {
    5
}

fn default_circuit_breaker_cooldown_seconds() -> u64 {
    60
}

fn default_signature_max_skew_seconds() -> u64 {
    300
}

fn default_server_port() -> u16 {
    8080
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_connect_retry_attempts() -> u32 {
    5
}

fn default_connect_retry_initial_delay_ms() -> u64 {
    500
}

fn default_connect_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_connect_retry_backoff_multiplier() -> u64 {
    2
}

/// Splits a comma-separated variable, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        Self::from_vars(std::env::vars())
    }

    /// Builds and validates a config from `(NAME, value)` pairs.
    pub fn from_vars<I>(vars: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config = envy::from_iter::<_, Self>(vars)
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_delivery_attempts == 0 {
            return Err(anyhow!("MAX_DELIVERY_ATTEMPTS must be at least 1"));
        }
        if self.circuit_breaker_failure_threshold == 0 {
            return Err(anyhow!("CIRCUIT_BREAKER_FAILURE_THRESHOLD must be at least 1"));
        }
        if self.poll_interval_seconds == 0 {
            return Err(anyhow!("POLL_INTERVAL_SECONDS must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(anyhow!("BATCH_SIZE must be at least 1"));
        }
        if self.delivery_timeout_seconds == 0 {
            return Err(anyhow!("DELIVERY_TIMEOUT_SECONDS must be at least 1"));
        }
        // The lease is renewed per event, so it only has to outlive one delivery.
        if self.lease_seconds <= self.delivery_timeout_seconds {
            return Err(anyhow!(
                "LEASE_SECONDS ({}) must exceed DELIVERY_TIMEOUT_SECONDS ({})",
                self.lease_seconds,
                self.delivery_timeout_seconds
            ));
        }

        self.backoff_schedule()?;
        self.denied_cidrs()
            .iter()
            .try_for_each(|cidr| {
                cidr.parse::<IpNetwork>()
                    .map(|_| ())
                    .map_err(|e| anyhow!("Invalid EGRESS_DENIED_CIDRS entry '{}': {}", cidr, e))
            })?;
        self.signing_secrets()?;

        Ok(())
    }

    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("dispatcher-{}", Uuid::new_v4()))
    }

    pub fn allowed_hosts(&self) -> Vec<String> {
        split_list(&self.egress_allowed_hosts)
    }

    pub fn denied_cidrs(&self) -> Vec<String> {
        split_list(&self.egress_denied_cidrs)
    }

    pub fn backoff_schedule(&self) -> Result<BackoffSchedule, Error> {
        let delays = split_list(&self.retry_backoff_seconds)
            .iter()
            .map(|raw| {
                raw.parse::<u64>()
                    .map_err(|_| anyhow!("Invalid RETRY_BACKOFF_SECONDS entry '{}'", raw))
            })
            .collect::<Result<Vec<_>, _>>()?;

        BackoffSchedule::from_secs(&delays)
    }

    /// Parses `WEBHOOK_NAMED_SECRETS` (`name:secret,name:secret`) on top of the global secret.
    pub fn signing_secrets(&self) -> Result<SigningSecrets, Error> {
        let named = self.webhook_named_secrets.as_deref().unwrap_or_default();

        split_list(named)
            .iter()
            .try_fold(
                SigningSecrets::new(self.webhook_signing_secret.clone()),
                |secrets, entry| {
                    let (name, secret) = entry
                        .split_once(':')
                        .map(|(name, secret)| (name.trim(), secret.trim()))
                        .filter(|(name, secret)| !name.is_empty() && !secret.is_empty())
                        .ok_or_else(|| {
                            anyhow!("WEBHOOK_NAMED_SECRETS entries must look like name:secret")
                        })?;
                    Ok(secrets.with_named(name, secret))
                },
            )
    }

    pub fn signature_max_skew(&self) -> Duration {
        Duration::from_secs(self.signature_max_skew_seconds)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            cooldown_seconds: self.circuit_breaker_cooldown_seconds,
        }
    }

    pub fn dispatcher_config(&self) -> Result<DispatcherConfig, Error> {
        Ok(DispatcherConfig {
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            max_attempts: self.max_delivery_attempts,
            batch_size: self.batch_size,
            lease: Duration::from_secs(self.lease_seconds),
            backoff: self.backoff_schedule()?,
            delivery_timeout: Duration::from_secs(self.delivery_timeout_seconds),
            dead_letter_permanent_failures: self.dead_letter_permanent_failures,
        })
    }
}
