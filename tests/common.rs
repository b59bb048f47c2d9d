use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{FutureExt, future::BoxFuture};
use outbox_dispatcher::{
    cache::CoordinationCache,
    clients::{
        adapter::{AdapterRegistry, ChannelAdapter},
        circuit_breaker::CircuitBreaker,
        memory::{MemoryCache, MemoryEventStore},
    },
    clock::{Clock, ManualClock},
    dispatcher::{Dispatcher, DispatcherConfig},
    error::DeliveryError,
    models::{
        circuit_breaker::CircuitBreakerConfig,
        event::OutboxEvent,
        retry::BackoffSchedule,
        rule::{Channel, NotificationRule},
    },
    store::EventStore,
};
use serde_json::json;
use uuid::Uuid;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn dispatcher_config(max_attempts: u32, backoff_secs: &[u64]) -> DispatcherConfig {
    DispatcherConfig {
        max_attempts,
        backoff: BackoffSchedule::from_secs(backoff_secs).unwrap(),
        delivery_timeout: Duration::from_secs(2),
        ..DispatcherConfig::default()
    }
}

pub fn breaker_config(failure_threshold: u32, cooldown_seconds: u64) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        cooldown_seconds,
    }
}

/// Adapter that replays a scripted list of results, then succeeds.
#[derive(Clone)]
pub struct ScriptedAdapter {
    channel: Channel,
    calls: Arc<AtomicU32>,
    script: Arc<Mutex<VecDeque<Result<(), DeliveryError>>>>,
    delay: Option<Duration>,
}

impl ScriptedAdapter {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            calls: Arc::new(AtomicU32::new(0)),
            script: Arc::new(Mutex::new(VecDeque::new())),
            delay: None,
        }
    }

    pub fn failing_with(self, errors: impl IntoIterator<Item = DeliveryError>) -> Self {
        self.script
            .lock()
            .unwrap()
            .extend(errors.into_iter().map(Err));
        self
    }

    pub fn always_failing(channel: Channel, times: usize) -> Self {
        Self::new(channel).failing_with((0..times).map(|_| server_error()))
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ChannelAdapter for ScriptedAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn deliver<'a>(
        &'a self,
        _rule: &'a NotificationRule,
        _event: &'a OutboxEvent,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or(Ok(()))
        }
        .boxed()
    }
}

pub fn server_error() -> DeliveryError {
    DeliveryError::HttpStatus {
        status: 500,
        body: "upstream exploded".to_string(),
    }
}

/// In-memory store, cache and manual clock shared by any number of dispatchers.
pub struct Harness {
    pub clock: ManualClock,
    pub store: MemoryEventStore,
    pub cache: Arc<MemoryCache>,
    pub breaker_config: CircuitBreakerConfig,
}

impl Harness {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        let clock = ManualClock::new(start_time());
        let cache = Arc::new(MemoryCache::new(Arc::new(clock.clone())));

        Self {
            clock,
            store: MemoryEventStore::new(),
            cache,
            breaker_config,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    pub fn breaker(&self, holder: &str) -> CircuitBreaker {
        let cache: Arc<dyn CoordinationCache> = self.cache.clone();
        CircuitBreaker::new(cache, self.clock(), self.breaker_config.clone(), holder)
    }

    pub fn dispatcher(
        &self,
        worker_id: &str,
        adapter: Arc<dyn ChannelAdapter>,
        config: DispatcherConfig,
    ) -> Dispatcher {
        self.dispatcher_with(worker_id, AdapterRegistry::new().register(adapter), config)
    }

    pub fn dispatcher_with(
        &self,
        worker_id: &str,
        adapters: AdapterRegistry,
        config: DispatcherConfig,
    ) -> Dispatcher {
        let store: Arc<dyn EventStore> = Arc::new(self.store.clone());
        Dispatcher::new(
            store,
            self.breaker(worker_id),
            adapters,
            self.clock(),
            config,
            worker_id,
        )
    }

    pub async fn rule(&self, rule: NotificationRule) -> NotificationRule {
        self.store.insert_rule(rule.clone()).await;
        rule
    }

    /// Enqueues an event created `offset_secs` after the start time.
    pub async fn enqueue(&self, rule_id: Uuid, offset_secs: i64) -> OutboxEvent {
        let created_at = start_time() + chrono::TimeDelta::seconds(offset_secs);
        let event = OutboxEvent::new(
            rule_id,
            json!({ "order_id": Uuid::new_v4(), "status": "ready" }),
            created_at,
        );
        self.store.enqueue(event.clone()).await;
        event
    }
}

pub fn console_rule() -> NotificationRule {
    NotificationRule::new(Uuid::new_v4(), "order.ready", Channel::Console)
        .with_target("kitchen-display")
}
