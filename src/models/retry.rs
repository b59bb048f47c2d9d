use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use chrono::{DateTime, Utc};

/// Exponential retry settings used for startup connections.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u64,
}

/// Escalating redelivery delays for failed outbox events.
///
/// The delay for a failed event is looked up by `min(attempts - 1, len - 1)`,
/// so the last step repeats once the schedule is exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    pub fn from_secs(delays: &[u64]) -> Result<Self, Error> {
        if delays.is_empty() {
            return Err(anyhow!("Backoff schedule must contain at least one delay"));
        }

        Ok(Self {
            delays: delays.iter().copied().map(Duration::from_secs).collect(),
        })
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn delay_for(&self, attempts: u32) -> Duration {
        let index = (attempts.saturating_sub(1) as usize).min(self.delays.len() - 1);
        self.delays[index]
    }

    pub fn next_attempt_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(attempts))
            .unwrap_or(chrono::TimeDelta::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(1800),
            ],
        }
    }
}
