use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use chrono::TimeDelta;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use crate::{
    clients::{
        adapter::{AdapterRegistry, ChannelAdapter},
        circuit_breaker::CircuitBreaker,
    },
    clock::Clock,
    error::{DeliveryError, FailureKind},
    metrics::DeliveryMetrics,
    models::{
        circuit_breaker::{Admission, CircuitState},
        event::{DeadLetterEntry, OutboxEvent},
        retry::BackoffSchedule,
        rule::NotificationRule,
    },
    store::EventStore,
    utils::destination_key,
};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub batch_size: usize,
    pub lease: Duration,
    pub backoff: BackoffSchedule,
    pub delivery_timeout: Duration,
    /// Dead-letter permanent failures on first sight instead of retrying them.
    pub dead_letter_permanent_failures: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 5,
            batch_size: 100,
            lease: Duration::from_secs(60),
            backoff: BackoffSchedule::default(),
            delivery_timeout: Duration::from_secs(5),
            dead_letter_permanent_failures: false,
        }
    }
}

/// What happened to a single claimed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Retried,
    DeadLettered,
    /// Breaker open; claim released with attempts untouched.
    Skipped,
    /// Rule missing or disabled; marked delivered without a send.
    Dropped,
    /// Another worker took the event over; this worker's outcome was discarded.
    LeaseLost,
}

/// Tally of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub lease_lost: usize,
    pub errored: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Delivered => self.delivered += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Dropped => self.dropped += 1,
            Outcome::LeaseLost => self.lease_lost += 1,
        }
    }
}

/// Polls the outbox and drives each due event to its next state.
pub struct Dispatcher {
    store: Arc<dyn EventStore>,
    breaker: CircuitBreaker,
    adapters: AdapterRegistry,
    metrics: DeliveryMetrics,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    worker_id: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn EventStore>,
        breaker: CircuitBreaker,
        adapters: AdapterRegistry,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            breaker,
            adapters,
            metrics: DeliveryMetrics::new(),
            clock,
            config,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs poll cycles forever. A failing cycle is logged and retried on the next tick.
    pub async fn run(&self) {
        info!(
            worker_id = %self.worker_id,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_attempts = self.config.max_attempts,
            batch_size = self.config.batch_size,
            "Dispatcher started"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.poll_once().await {
                Ok(report) if report.claimed > 0 => info!(
                    claimed = report.claimed,
                    delivered = report.delivered,
                    retried = report.retried,
                    dead_lettered = report.dead_lettered,
                    skipped = report.skipped,
                    dropped = report.dropped,
                    lease_lost = report.lease_lost,
                    errored = report.errored,
                    "Poll cycle complete"
                ),
                Ok(_) => debug!("No due events"),
                Err(e) => error!(error = %e, "Poll cycle failed"),
            }
        }
    }

    /// Claims due events and processes them sequentially, oldest first.
    pub async fn poll_once(&self) -> Result<CycleReport, Error> {
        let events = self
            .store
            .claim_due(
                &self.worker_id,
                self.clock.now(),
                self.config.lease,
                self.config.batch_size,
            )
            .await?;

        self.metrics.set_batch_size(events.len());

        let mut report = CycleReport {
            claimed: events.len(),
            ..CycleReport::default()
        };

        for event in events {
            let event_id = event.id;

            match self.process_event(event).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    report.errored += 1;
                    error!(event_id = %event_id, error = %e, "Failed to process event");

                    if let Err(e) = self.store.release(event_id, &self.worker_id).await {
                        warn!(event_id = %event_id, error = %e, "Failed to release event lease");
                    }
                }
            }
        }

        Ok(report)
    }

    async fn process_event(&self, event: OutboxEvent) -> Result<Outcome, Error> {
        // Events late in a batch would otherwise run on a lease stamped at claim time.
        let lease_until = self
            .clock
            .now()
            .checked_add_signed(TimeDelta::from_std(self.config.lease)?)
            .ok_or_else(|| anyhow!("Lease expiry out of range"))?;
        if !self
            .store
            .renew_lease(event.id, &self.worker_id, lease_until)
            .await?
        {
            return Ok(self.lease_lost(&event, "before delivery"));
        }

        let rule = match self.store.find_rule(event.rule_id).await? {
            Some(rule) if rule.enabled => rule,
            other => {
                let reason = if other.is_some() {
                    "rule disabled"
                } else {
                    "rule missing"
                };
                warn!(
                    event_id = %event.id,
                    rule_id = %event.rule_id,
                    reason,
                    "Dropping event without delivery"
                );

                if !self
                    .store
                    .mark_delivered(event.id, &self.worker_id, event.attempts)
                    .await?
                {
                    return Ok(self.lease_lost(&event, "while dropping"));
                }
                self.metrics.record_dropped();
                return Ok(Outcome::Dropped);
            }
        };

        let adapter = self.adapters.get(rule.channel);
        let destination = adapter
            .as_ref()
            .map(|adapter| adapter.destination(&rule))
            .unwrap_or_else(|| format!("{}:{}", rule.channel, rule.target()));
        let label = destination_key(&destination);

        let admission = self.breaker.admit(&destination).await?;
        if admission == Admission::Rejected {
            debug!(
                event_id = %event.id,
                destination = %label,
                "Breaker open, skipping event this cycle"
            );
            if !self.store.release(event.id, &self.worker_id).await? {
                return Ok(self.lease_lost(&event, "while skipping"));
            }
            self.metrics.record_breaker_skip(&label, rule.channel);
            self.metrics.set_breaker_state(&label, CircuitState::Open);
            return Ok(Outcome::Skipped);
        }
        if admission == Admission::Trial {
            self.metrics.set_breaker_state(&label, CircuitState::HalfOpen);
        }

        let attempts = event.attempts.saturating_add(1);
        self.metrics.record_attempt(&label, rule.channel);

        let result = match adapter {
            Some(adapter) => self.invoke(adapter.as_ref(), &rule, &event).await,
            None => Err(DeliveryError::NoAdapter(rule.channel.to_string())),
        };

        match result {
            Ok(()) => {
                if !self
                    .store
                    .mark_delivered(event.id, &self.worker_id, attempts)
                    .await?
                {
                    return Ok(self.lease_lost(&event, "after delivery"));
                }
                self.metrics.record_delivered(&label, rule.channel);

                info!(
                    event_id = %event.id,
                    rule_id = %rule.id,
                    channel = %rule.channel,
                    destination = %label,
                    attempts,
                    trial = admission == Admission::Trial,
                    "Event delivered"
                );

                if let Some(state) = self.signal_breaker(&destination, true).await {
                    self.metrics.set_breaker_state(&label, state);
                }

                Ok(Outcome::Delivered)
            }
            Err(e) => {
                let kind = e.kind();
                self.metrics.record_failure(&label, rule.channel, kind);

                let outcome = self
                    .record_failure(&event, &rule, attempts, &label, &e)
                    .await?;
                if outcome == Outcome::LeaseLost {
                    return Ok(outcome);
                }

                if let Some(state) = self.signal_breaker(&destination, false).await {
                    self.metrics.set_breaker_state(&label, state);
                }

                Ok(outcome)
            }
        }
    }

    async fn invoke(
        &self,
        adapter: &dyn ChannelAdapter,
        rule: &NotificationRule,
        event: &OutboxEvent,
    ) -> Result<(), DeliveryError> {
        match timeout(self.config.delivery_timeout, adapter.deliver(rule, event)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.config.delivery_timeout)),
        }
    }

    async fn record_failure(
        &self,
        event: &OutboxEvent,
        rule: &NotificationRule,
        attempts: u32,
        label: &str,
        error: &DeliveryError,
    ) -> Result<Outcome, Error> {
        let kind = error.kind();
        let exhausted = attempts >= self.config.max_attempts;
        let give_up =
            exhausted || (kind == FailureKind::Permanent && self.config.dead_letter_permanent_failures);

        if give_up {
            let entry = DeadLetterEntry::new(event, rule, error.to_string(), self.clock.now());

            if !self
                .store
                .move_to_dead_letter(entry, &self.worker_id)
                .await?
            {
                return Ok(self.lease_lost(event, "before dead-lettering"));
            }

            self.metrics.record_dead_letter(label, rule.channel);
            warn!(
                event_id = %event.id,
                rule_id = %rule.id,
                channel = %rule.channel,
                destination = %label,
                attempts,
                kind = kind.as_str(),
                error = %error,
                "Event moved to dead-letter store"
            );

            return Ok(Outcome::DeadLettered);
        }

        let next_attempt_at = self
            .config
            .backoff
            .next_attempt_at(attempts, self.clock.now());
        if !self
            .store
            .schedule_retry(event.id, &self.worker_id, attempts, next_attempt_at)
            .await?
        {
            return Ok(self.lease_lost(event, "before scheduling retry"));
        }

        warn!(
            event_id = %event.id,
            rule_id = %rule.id,
            channel = %rule.channel,
            destination = %label,
            attempts,
            kind = kind.as_str(),
            error = %error,
            %next_attempt_at,
            "Delivery failed, retry scheduled"
        );

        Ok(Outcome::Retried)
    }

    fn lease_lost(&self, event: &OutboxEvent, stage: &str) -> Outcome {
        warn!(
            event_id = %event.id,
            worker_id = %self.worker_id,
            stage,
            "Lease lost, discarding outcome"
        );
        self.metrics.record_lease_lost();
        Outcome::LeaseLost
    }

    /// Runs after the outbox write. Cache errors are logged, not propagated.
    async fn signal_breaker(&self, destination: &str, success: bool) -> Option<CircuitState> {
        let result = if success {
            self.breaker.record_success(destination).await
        } else {
            self.breaker.record_failure(destination).await
        };

        result
            .inspect_err(|e| warn!(error = %e, "Failed to update circuit breaker"))
            .ok()
    }
}
