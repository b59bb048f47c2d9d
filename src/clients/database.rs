use std::time::Duration;

use anyhow::{Context, Error, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::{FutureExt, future::BoxFuture};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    models::{
        event::{DeadLetterEntry, OutboxEvent},
        rule::{NotificationRule, RuleConfig},
    },
    store::EventStore,
};

const SCHEMA: &str = include_str!("../../migrations/0001_outbox.sql");

/// Postgres-backed outbox, rule registry and dead-letter store.
pub struct DatabaseClient {
    client: Mutex<Client>,
}

impl DatabaseClient {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection terminated");
            }
        });

        info!("PostgreSQL connection established");

        Ok(Self {
            client: Mutex::new(client),
        })
    }

    pub async fn ensure_schema(&self) -> Result<(), Error> {
        self.client
            .lock()
            .await
            .batch_execute(SCHEMA)
            .await
            .context("Failed to apply outbox schema")?;

        debug!("Outbox schema applied");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        self.client
            .lock()
            .await
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| anyhow!("Database health check failed: {}", e))?;

        Ok(())
    }

    fn event_from_row(row: &Row) -> Result<OutboxEvent, Error> {
        let attempts: i32 = row.try_get("attempts")?;
        let status: String = row.try_get("status")?;

        Ok(OutboxEvent {
            id: row.try_get("id")?,
            rule_id: row.try_get("rule_id")?,
            payload: row.try_get("payload")?,
            status: status.parse()?,
            attempts: u32::try_from(attempts)
                .map_err(|_| anyhow!("Negative attempt count {}", attempts))?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn rule_from_row(row: &Row) -> Result<NotificationRule, Error> {
        let channel: String = row.try_get("channel")?;
        let config: serde_json::Value = row.try_get("config")?;

        Ok(NotificationRule {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            event: row.try_get("event")?,
            channel: channel.parse()?,
            config: serde_json::from_value::<RuleConfig>(config)
                .context("Malformed rule configuration")?,
            enabled: row.try_get("enabled")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn to_i32(value: u32) -> Result<i32, Error> {
    i32::try_from(value).map_err(|_| anyhow!("Attempt count {} out of range", value))
}

impl EventStore for DatabaseClient {
    fn claim_due<'a>(
        &'a self,
        worker_id: &'a str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<OutboxEvent>, Error>> {
        async move {
            let lease_until = now
                .checked_add_signed(TimeDelta::from_std(lease)?)
                .ok_or_else(|| anyhow!("Lease expiry out of range"))?;
            let limit = i64::try_from(limit)?;

            let rows = self
                .client
                .lock()
                .await
                .query(
                    r#"
                    UPDATE outbox_events
                    SET lease_owner = $1, lease_expires_at = $2
                    WHERE id IN (
                        SELECT id FROM outbox_events
                        WHERE status = 'queued'
                          AND (next_attempt_at IS NULL OR next_attempt_at <= $3)
                          AND (lease_expires_at IS NULL OR lease_expires_at <= $3)
                        ORDER BY created_at
                        LIMIT $4
                        FOR UPDATE SKIP LOCKED
                    )
                    RETURNING id, rule_id, payload, status, attempts, next_attempt_at, created_at
                    "#,
                    &[&worker_id, &lease_until, &now, &limit],
                )
                .await
                .map_err(|e| anyhow!("Failed to claim due events: {}", e))?;

            let mut events = rows
                .iter()
                .map(Self::event_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            events.sort_by_key(|event| event.created_at);

            Ok(events)
        }
        .boxed()
    }

    fn find_rule(&self, rule_id: Uuid) -> BoxFuture<'_, Result<Option<NotificationRule>, Error>> {
        async move {
            let row = self
                .client
                .lock()
                .await
                .query_opt(
                    r#"
                    SELECT id, tenant_id, event, channel, config, enabled, created_at
                    FROM notification_rules
                    WHERE id = $1
                    "#,
                    &[&rule_id],
                )
                .await
                .map_err(|e| anyhow!("Failed to load rule {}: {}", rule_id, e))?;

            row.as_ref().map(Self::rule_from_row).transpose()
        }
        .boxed()
    }

    fn renew_lease<'a>(
        &'a self,
        event_id: Uuid,
        worker_id: &'a str,
        lease_until: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            let renewed = self
                .client
                .lock()
                .await
                .execute(
                    r#"
                    UPDATE outbox_events
                    SET lease_expires_at = $3
                    WHERE id = $1 AND lease_owner = $2 AND status = 'queued'
                    "#,
                    &[&event_id, &worker_id, &lease_until],
                )
                .await
                .map_err(|e| anyhow!("Failed to renew lease on {}: {}", event_id, e))?;
            Ok(renewed == 1)
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
            let updated = self
                .client
                .lock()
                .await
                .execute(
                    r#"
                    UPDATE outbox_events
                    SET status = 'delivered', attempts = $3, next_attempt_at = NULL,
                        lease_owner = NULL, lease_expires_at = NULL
                    WHERE id = $1 AND lease_owner = $2 AND status = 'queued'
                    "#,
                    &[&event_id, &worker_id, &to_i32(attempts)?],
                )
                .await
                .map_err(|e| anyhow!("Failed to mark event {} delivered: {}", event_id, e))?;
            Ok(updated == 1)
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
            let updated = self
                .client
                .lock()
                .await
                .execute(
                    r#"
                    UPDATE outbox_events
                    SET attempts = $3, next_attempt_at = $4,
                        lease_owner = NULL, lease_expires_at = NULL
                    WHERE id = $1 AND lease_owner = $2 AND status = 'queued'
                    "#,
                    &[&event_id, &worker_id, &to_i32(attempts)?, &next_attempt_at],
                )
                .await
                .map_err(|e| anyhow!("Failed to schedule retry for {}: {}", event_id, e))?;
            Ok(updated == 1)
        }
        .boxed()
    }

    fn release<'a>(&'a self, event_id: Uuid, worker_id: &'a str) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            let updated = self
                .client
                .lock()
                .await
                .execute(
                    r#"
                    UPDATE outbox_events
                    SET lease_owner = NULL, lease_expires_at = NULL
                    WHERE id = $1 AND lease_owner = $2 AND status = 'queued'
                    "#,
                    &[&event_id, &worker_id],
                )
                .await
                .map_err(|e| anyhow!("Failed to release event {}: {}", event_id, e))?;
            Ok(updated == 1)
        }
        .boxed()
    }

    fn move_to_dead_letter<'a>(
        &'a self,
        entry: DeadLetterEntry,
        worker_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            let mut client = self.client.lock().await;
            let tx = client
                .transaction()
                .await
                .map_err(|e| anyhow!("Failed to open dead-letter transaction: {}", e))?;

            let removed = tx
                .execute(
                    r#"
                    DELETE FROM outbox_events
                    WHERE id = $1 AND lease_owner = $2 AND status = 'queued'
                    "#,
                    &[&entry.original_id, &worker_id],
                )
                .await?;

            if removed == 0 {
                tx.rollback().await?;
                return Ok(false);
            }

            tx.execute(
                r#"
                INSERT INTO dead_letters (
                    id, original_id, rule_id, event, channel, target, payload, error, failed_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (original_id) DO NOTHING
                "#,
                &[
                    &entry.id,
                    &entry.original_id,
                    &entry.rule_id,
                    &entry.event,
                    &entry.channel.as_str(),
                    &entry.target,
                    &entry.payload,
                    &entry.error,
                    &entry.failed_at,
                ],
            )
            .await?;

            tx.commit()
                .await
                .map_err(|e| anyhow!("Failed to commit dead-letter move: {}", e))?;

            Ok(true)
        }
        .boxed()
    }
}
