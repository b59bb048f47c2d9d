use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::{
    rule::{Channel, NotificationRule},
    status::EventStatus,
};

/// A row of the outbox table awaiting (or past) delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub payload: JsonValue,
    pub status: EventStatus,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(rule_id: Uuid, payload: JsonValue, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id,
            payload,
            status: EventStatus::Queued,
            attempts: 0,
            next_attempt_at: None,
            created_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Queued && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Quarantined copy of an event that exhausted its delivery budget.
///
/// Carries enough context (rule, channel, target, payload, last error) for an
/// operator to inspect and replay the delivery by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub original_id: Uuid,
    pub rule_id: Uuid,
    pub event: String,
    pub channel: Channel,
    pub target: String,
    pub payload: JsonValue,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        event: &OutboxEvent,
        rule: &NotificationRule,
        error: String,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_id: event.id,
            rule_id: rule.id,
            event: rule.event.clone(),
            channel: rule.channel,
            target: rule.target(),
            payload: event.payload.clone(),
            error,
            failed_at,
        }
    }
}
