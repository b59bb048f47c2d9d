use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn from_string(s: &str) -> Self {
        match s {
            "open" => CircuitState::Open,
            "half_open" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding exported on the breaker state gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_seconds: 60,
        }
    }
}

/// Point-in-time view of a destination's breaker as stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerState {
    pub state: CircuitState,
    pub opened_until: Option<DateTime<Utc>>,
    pub failure_count: u32,
}

/// Verdict returned when asking the breaker whether a delivery may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed, deliver normally.
    Allowed,
    /// Cooldown elapsed and this caller holds the single half-open probe.
    Trial,
    /// Breaker open, or another caller is running the trial.
    Rejected,
}

