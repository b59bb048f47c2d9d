//! Persistence seam between the dispatcher and the outbox tables.
//!
//! The dispatcher only ever talks to this trait, so the Postgres client and the
//! in-memory store used by tests are interchangeable.

use std::time::Duration;

use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::models::{
    event::{DeadLetterEntry, OutboxEvent},
    rule::NotificationRule,
};

pub trait EventStore: Send + Sync {
    /// Claims up to `limit` due events for `worker_id`, oldest first.
    ///
    /// An event is due when it is `queued`, its `next_attempt_at` is unset or
    /// not in the future, and no other worker holds an unexpired lease on it.
    /// Claimed rows are leased until `now + lease` so concurrent workers skip
    /// them.
    fn claim_due<'a>(
        &'a self,
        worker_id: &'a str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<OutboxEvent>, Error>>;

    fn find_rule(&self, rule_id: Uuid) -> BoxFuture<'_, Result<Option<NotificationRule>, Error>>;

    /// Pushes the lease of an event `worker_id` still owns out to `lease_until`.
    ///
    /// Returns `false` when the lease was lost to another worker or the event
    /// is no longer queued.
    fn renew_lease<'a>(
        &'a self,
        event_id: Uuid,
        worker_id: &'a str,
        lease_until: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, Error>>;

    // Every write below is fenced on `worker_id` holding the lease of a queued
    // row. `false` means the lease was lost and nothing was written.

    /// Terminal success (or drop). Clears the lease.
    fn mark_delivered<'a>(
        &'a self,
        event_id: Uuid,
        worker_id: &'a str,
        attempts: u32,
    ) -> BoxFuture<'a, Result<bool, Error>>;

    /// Records a failed attempt and when the event becomes due again. Clears the lease.
    fn schedule_retry<'a>(
        &'a self,
        event_id: Uuid,
        worker_id: &'a str,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, Error>>;

    /// Gives the claim back without touching attempt bookkeeping.
    fn release<'a>(&'a self, event_id: Uuid, worker_id: &'a str) -> BoxFuture<'a, Result<bool, Error>>;

    /// Atomically removes the outbox row and writes the dead-letter entry.
    ///
    /// Returns `false`, writing nothing, when the outbox row no longer exists
    /// or is not leased to `worker_id`.
    fn move_to_dead_letter<'a>(
        &'a self,
        entry: DeadLetterEntry,
        worker_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>>;
}
