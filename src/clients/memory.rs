//! In-process implementations of the cache and event store.
//!
//! These back the test suite and single-process local runs. They honour the
//! same contracts as Redis and Postgres, but state is only shared between
//! clones inside one process.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::{FutureExt, future::BoxFuture};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    cache::CoordinationCache,
    clock::Clock,
    models::{
        event::{DeadLetterEntry, OutboxEvent},
        rule::NotificationRule,
        status::EventStatus,
    },
    store::EventStore,
};

struct CacheEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Key-value cache whose TTLs follow the injected clock.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn live<'m>(
        entries: &'m mut HashMap<String, CacheEntry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'m mut CacheEntry> {
        let expired = entries
            .get(key)
            .is_some_and(|entry| entry.expires_at.is_some_and(|at| at <= now));
        if expired {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

impl CoordinationCache for MemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, Error>> {
        async move {
            let now = self.clock.now();
            let mut entries = self.entries.lock().await;
            Ok(Self::live(&mut entries, key, now).map(|entry| entry.value.clone()))
        }
        .boxed()
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            self.entries.lock().await.insert(
                key.to_string(),
                CacheEntry {
                    value,
                    expires_at: None,
                },
            );
            Ok(())
        }
        .boxed()
    }

    fn set_nx_ex<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            let now = self.clock.now();
            let mut entries = self.entries.lock().await;
            if Self::live(&mut entries, key, now).is_some() {
                return Ok(false);
            }

            let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
            entries.insert(
                key.to_string(),
                CacheEntry {
                    value,
                    expires_at: now.checked_add_signed(ttl),
                },
            );
            Ok(true)
        }
        .boxed()
    }

    fn incr<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<i64, Error>> {
        async move {
            let now = self.clock.now();
            let mut entries = self.entries.lock().await;
            let next = match Self::live(&mut entries, key, now) {
                Some(entry) => {
                    let current = entry
                        .value
                        .parse::<i64>()
                        .map_err(|_| anyhow!("Value at '{}' is not an integer", key))?;
                    entry.value = (current + 1).to_string();
                    current + 1
                }
                None => {
                    entries.insert(
                        key.to_string(),
                        CacheEntry {
                            value: "1".to_string(),
                            expires_at: None,
                        },
                    );
                    1
                }
            };
            Ok(next)
        }
        .boxed()
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let mut entries = self.entries.lock().await;
            for key in keys {
                entries.remove(key);
            }
            Ok(())
        }
        .boxed()
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), Error>> {
        async { Ok(()) }.boxed()
    }
}

struct StoredEvent {
    event: OutboxEvent,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StoreState {
    rules: HashMap<Uuid, NotificationRule>,
    events: HashMap<Uuid, StoredEvent>,
    dead_letters: Vec<DeadLetterEntry>,
}

impl StoredEvent {
    fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

impl StoreState {
    /// The event, if it is still queued and leased to `worker_id`.
    fn owned_mut(&mut self, event_id: Uuid, worker_id: &str) -> Option<&mut StoredEvent> {
        self.events.get_mut(&event_id).filter(|stored| {
            stored.event.status == EventStatus::Queued
                && stored.lease_owner.as_deref() == Some(worker_id)
        })
    }
}

/// Event store kept in memory; clones share state.
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_rule(&self, rule: NotificationRule) {
        self.state.lock().await.rules.insert(rule.id, rule);
    }

    pub async fn enqueue(&self, event: OutboxEvent) {
        self.state.lock().await.events.insert(
            event.id,
            StoredEvent {
                event,
                lease_owner: None,
                lease_expires_at: None,
            },
        );
    }

    pub async fn event(&self, event_id: Uuid) -> Option<OutboxEvent> {
        self.state
            .lock()
            .await
            .events
            .get(&event_id)
            .map(|stored| stored.event.clone())
    }

    pub async fn lease_owner(&self, event_id: Uuid) -> Option<String> {
        self.state
            .lock()
            .await
            .events
            .get(&event_id)
            .and_then(|stored| stored.lease_owner.clone())
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.state.lock().await.dead_letters.clone()
    }
}

impl EventStore for MemoryEventStore {
    fn claim_due<'a>(
        &'a self,
        worker_id: &'a str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<OutboxEvent>, Error>> {
        async move {
            let lease_until =
                now.checked_add_signed(TimeDelta::from_std(lease).unwrap_or(TimeDelta::MAX));
            let mut state = self.state.lock().await;

            let mut due: Vec<&mut StoredEvent> = state
                .events
                .values_mut()
                .filter(|stored| stored.event.is_due(now))
                .filter(|stored| stored.lease_expires_at.is_none_or(|at| at <= now))
                .collect();
            due.sort_by_key(|stored| stored.event.created_at);

            Ok(due
                .into_iter()
                .take(limit)
                .map(|stored| {
                    stored.lease_owner = Some(worker_id.to_string());
                    stored.lease_expires_at = lease_until;
                    stored.event.clone()
                })
                .collect())
        }
        .boxed()
    }

    fn find_rule(&self, rule_id: Uuid) -> BoxFuture<'_, Result<Option<NotificationRule>, Error>> {
        async move { Ok(self.state.lock().await.rules.get(&rule_id).cloned()) }.boxed()
    }

    fn renew_lease<'a>(
        &'a self,
        event_id: Uuid,
        worker_id: &'a str,
        lease_until: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            let mut state = self.state.lock().await;
            Ok(match state.owned_mut(event_id, worker_id) {
                Some(stored) => {
                    stored.lease_expires_at = Some(lease_until);
                    true
                }
                None => false,
            })
        }
        .boxed()
    }

    fn mark_delivered<'a>(
        &'a self,
        event_id: Uuid,
        worker_id: &'a str,
        attempts: u32,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            let mut state = self.state.lock().await;
            Ok(match state.owned_mut(event_id, worker_id) {
                Some(stored) => {
                    stored.event.status = EventStatus::Delivered;
                    stored.event.attempts = attempts;
                    stored.event.next_attempt_at = None;
                    stored.clear_lease();
                    true
                }
                None => false,
            })
        }
        .boxed()
    }

    fn schedule_retry<'a>(
        &'a self,
        event_id: Uuid,
        worker_id: &'a str,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            let mut state = self.state.lock().await;
            Ok(match state.owned_mut(event_id, worker_id) {
                Some(stored) => {
                    stored.event.attempts = attempts;
                    stored.event.next_attempt_at = Some(next_attempt_at);
                    stored.clear_lease();
                    true
                }
                None => false,
            })
        }
        .boxed()
    }

    fn release<'a>(&'a self, event_id: Uuid, worker_id: &'a str) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            let mut state = self.state.lock().await;
            Ok(match state.owned_mut(event_id, worker_id) {
                Some(stored) => {
                    stored.clear_lease();
                    true
                }
                None => false,
            })
        }
        .boxed()
    }

    fn move_to_dead_letter<'a>(
        &'a self,
        entry: DeadLetterEntry,
        worker_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            let mut state = self.state.lock().await;
            if state.owned_mut(entry.original_id, worker_id).is_none() {
                return Ok(false);
            }
            state.events.remove(&entry.original_id);
            state.dead_letters.push(entry);
            Ok(true)
        }
        .boxed()
    }
}
