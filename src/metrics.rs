//! Delivery counters and breaker gauges, labelled by destination hash and channel.
//!
//! Recording goes through the `metrics` facade; without an installed recorder
//! (tests) every call is a no-op.

use ::metrics::{counter, describe_counter, describe_gauge, gauge};

use crate::{
    error::FailureKind,
    models::{circuit_breaker::CircuitState, rule::Channel},
};

pub const ATTEMPTS_TOTAL: &str = "notification_delivery_attempts_total";
pub const FAILURES_TOTAL: &str = "notification_delivery_failures_total";
pub const DELIVERED_TOTAL: &str = "notification_deliveries_total";
pub const DEAD_LETTERS_TOTAL: &str = "notification_dead_letters_total";
pub const BREAKER_SKIPS_TOTAL: &str = "notification_breaker_skips_total";
pub const DROPPED_TOTAL: &str = "notification_dropped_total";
pub const LEASE_LOST_TOTAL: &str = "notification_lease_lost_total";
pub const BREAKER_STATE: &str = "notification_breaker_state";
pub const POLL_BATCH_SIZE: &str = "notification_poll_batch_size";

#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn new() -> Self {
        Self
    }

    /// Registers help text with the installed recorder.
    pub fn describe() {
        describe_counter!(ATTEMPTS_TOTAL, "Adapter invocations, successful or not");
        describe_counter!(FAILURES_TOTAL, "Adapter invocations that failed");
        describe_counter!(DELIVERED_TOTAL, "Events delivered successfully");
        describe_counter!(DEAD_LETTERS_TOTAL, "Events moved to the dead-letter store");
        describe_counter!(
            BREAKER_SKIPS_TOTAL,
            "Due events skipped because the destination breaker was open"
        );
        describe_counter!(DROPPED_TOTAL, "Events dropped because their rule is missing or disabled");
        describe_counter!(LEASE_LOST_TOTAL, "Outcomes discarded because another worker took the lease");
        describe_gauge!(BREAKER_STATE, "Breaker state per destination (0 closed, 1 open, 2 half_open)");
        describe_gauge!(POLL_BATCH_SIZE, "Events claimed in the latest poll cycle");
    }

    pub fn record_attempt(&self, destination: &str, channel: Channel) {
        counter!(ATTEMPTS_TOTAL, "destination" => destination.to_string(), "channel" => channel.as_str())
            .increment(1);
    }

    pub fn record_delivered(&self, destination: &str, channel: Channel) {
        counter!(DELIVERED_TOTAL, "destination" => destination.to_string(), "channel" => channel.as_str())
            .increment(1);
    }

    pub fn record_failure(&self, destination: &str, channel: Channel, kind: FailureKind) {
        counter!(
            FAILURES_TOTAL,
            "destination" => destination.to_string(),
            "channel" => channel.as_str(),
            "kind" => kind.as_str()
        )
        .increment(1);
    }

    pub fn record_dead_letter(&self, destination: &str, channel: Channel) {
        counter!(DEAD_LETTERS_TOTAL, "destination" => destination.to_string(), "channel" => channel.as_str())
            .increment(1);
    }

    pub fn record_breaker_skip(&self, destination: &str, channel: Channel) {
        counter!(BREAKER_SKIPS_TOTAL, "destination" => destination.to_string(), "channel" => channel.as_str())
            .increment(1);
    }

    pub fn record_dropped(&self) {
        counter!(DROPPED_TOTAL).increment(1);
    }

    pub fn record_lease_lost(&self) {
        counter!(LEASE_LOST_TOTAL).increment(1);
    }

    pub fn set_breaker_state(&self, destination: &str, state: CircuitState) {
        gauge!(BREAKER_STATE, "destination" => destination.to_string()).set(state.as_gauge());
    }

    pub fn set_batch_size(&self, size: usize) {
        gauge!(POLL_BATCH_SIZE).set(size as f64);
    }
}
