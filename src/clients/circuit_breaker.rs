use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::{
    cache::CoordinationCache,
    clock::Clock,
    models::circuit_breaker::{Admission, BreakerState, CircuitBreakerConfig, CircuitState},
    utils::destination_key,
};

/// Per-destination breaker whose state lives entirely in the coordination cache.
///
/// Keys, per destination hash `h`:
/// - `breaker:{h}:failures`     failure counter (INCR)
/// - `breaker:{h}:opened_until` unix millis; present while open or awaiting a trial
/// - `breaker:{h}:state`        last written state, for observers
/// - `breaker:{h}:trial`        half-open probe lock (SET NX EX)
#[derive(Clone)]
pub struct CircuitBreaker {
    cache: Arc<dyn CoordinationCache>,
    clock: Arc<dyn Clock>,
    config: CircuitBreakerConfig,
    holder_id: String,
}

struct BreakerKeys {
    failures: String,
    opened_until: String,
    state: String,
    trial: String,
}

impl BreakerKeys {
    fn new(destination: &str) -> Self {
        let hash = destination_key(destination);
        Self {
            failures: format!("breaker:{}:failures", hash),
            opened_until: format!("breaker:{}:opened_until", hash),
            state: format!("breaker:{}:state", hash),
            trial: format!("breaker:{}:trial", hash),
        }
    }
}

impl CircuitBreaker {
    pub fn new(
        cache: Arc<dyn CoordinationCache>,
        clock: Arc<dyn Clock>,
        config: CircuitBreakerConfig,
        holder_id: impl Into<String>,
    ) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            cooldown_seconds = config.cooldown_seconds,
            "Circuit breaker initialized"
        );

        Self {
            cache,
            clock,
            config,
            holder_id: holder_id.into(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// False while the breaker is open and its cooldown has not elapsed, or
    /// while another caller holds the half-open trial.
    ///
    /// Read-only: it never takes the trial lock, so asking does not use up the
    /// probe that `admit` hands out.
    pub async fn allow(&self, destination: &str) -> Result<bool, Error> {
        let keys = BreakerKeys::new(destination);

        let Some(opened_until) = self.opened_until(&keys).await? else {
            return Ok(true);
        };
        if self.clock.now() < opened_until {
            return Ok(false);
        }

        Ok(self.cache.get(&keys.trial).await?.is_none())
    }

    /// Decides whether a delivery to `destination` may go ahead.
    ///
    /// Once the cooldown has elapsed exactly one caller across all workers
    /// wins the trial lock and is told to run the half-open probe.
    pub async fn admit(&self, destination: &str) -> Result<Admission, Error> {
        let keys = BreakerKeys::new(destination);

        let Some(opened_until) = self.opened_until(&keys).await? else {
            return Ok(Admission::Allowed);
        };

        let now = self.clock.now();
        if now < opened_until {
            debug!(destination, %opened_until, "Circuit breaker open, rejecting delivery");
            return Ok(Admission::Rejected);
        }

        let acquired = self
            .cache
            .set_nx_ex(&keys.trial, self.holder_id.clone(), self.trial_lock_ttl())
            .await?;

        if !acquired {
            debug!(destination, "Half-open trial already in flight");
            return Ok(Admission::Rejected);
        }

        self.cache
            .set(&keys.state, CircuitState::HalfOpen.as_str().to_string())
            .await?;
        info!(destination, "Circuit breaker half-open, allowing trial delivery");

        Ok(Admission::Trial)
    }

    /// Resets the failure count and closes the breaker.
    pub async fn record_success(&self, destination: &str) -> Result<CircuitState, Error> {
        let keys = BreakerKeys::new(destination);
        let previous = self.stored_state(&keys).await?;

        self.cache
            .delete(&[
                keys.failures.clone(),
                keys.opened_until.clone(),
                keys.trial.clone(),
            ])
            .await?;
        self.cache
            .set(&keys.state, CircuitState::Closed.as_str().to_string())
            .await?;

        if previous != CircuitState::Closed {
            info!(destination, "Circuit breaker closed after successful trial");
        }

        Ok(CircuitState::Closed)
    }

    /// Counts a failure; opens the breaker once the threshold is reached.
    /// A failed half-open trial re-opens immediately with a fresh cooldown.
    pub async fn record_failure(&self, destination: &str) -> Result<CircuitState, Error> {
        let keys = BreakerKeys::new(destination);
        let failures = self.cache.incr(&keys.failures).await?;

        if self.stored_state(&keys).await? == CircuitState::HalfOpen {
            self.open(&keys).await?;
            warn!(destination, failures, "Circuit breaker re-opened after failed trial");
            return Ok(CircuitState::Open);
        }

        debug!(
            destination,
            failures,
            threshold = self.config.failure_threshold,
            "Circuit breaker failure recorded"
        );

        if failures >= i64::from(self.config.failure_threshold) {
            self.open(&keys).await?;
            warn!(destination, failures, "Circuit breaker opened");
            return Ok(CircuitState::Open);
        }

        self.stored_state(&keys).await
    }

    pub async fn state(&self, destination: &str) -> Result<BreakerState, Error> {
        let keys = BreakerKeys::new(destination);

        let failure_count = self
            .cache
            .get(&keys.failures)
            .await?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);

        Ok(BreakerState {
            state: self.stored_state(&keys).await?,
            opened_until: self.opened_until(&keys).await?,
            failure_count,
        })
    }

    async fn open(&self, keys: &BreakerKeys) -> Result<(), Error> {
        let cooldown = TimeDelta::try_seconds(self.cooldown_secs()).unwrap_or(TimeDelta::MAX);
        let until = self
            .clock
            .now()
            .checked_add_signed(cooldown)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.cache
            .set(&keys.opened_until, until.timestamp_millis().to_string())
            .await?;
        self.cache
            .set(&keys.state, CircuitState::Open.as_str().to_string())
            .await?;
        self.cache.delete(std::slice::from_ref(&keys.trial)).await?;

        Ok(())
    }

    async fn stored_state(&self, keys: &BreakerKeys) -> Result<CircuitState, Error> {
        Ok(self
            .cache
            .get(&keys.state)
            .await?
            .map(|s| CircuitState::from_string(&s))
            .unwrap_or(CircuitState::Closed))
    }

    async fn opened_until(&self, keys: &BreakerKeys) -> Result<Option<DateTime<Utc>>, Error> {
        Ok(self
            .cache
            .get(&keys.opened_until)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis))
    }

    fn cooldown_secs(&self) -> i64 {
        i64::try_from(self.config.cooldown_seconds).unwrap_or(i64::MAX)
    }

    /// A worker that dies mid-trial must not wedge the destination forever.
    fn trial_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.config.cooldown_seconds.max(1))
    }
}
