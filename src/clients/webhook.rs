use std::{collections::HashMap, sync::Arc, time::Duration};

use futures_util::{FutureExt, future::BoxFuture};
use reqwest::{Client, header::CONTENT_TYPE, redirect::Policy};
use tracing::{debug, warn};

use crate::{
    clients::adapter::ChannelAdapter,
    clock::Clock,
    egress::{EgressFilter, VettedDestination},
    error::DeliveryError,
    models::{
        event::OutboxEvent,
        rule::{Channel, NotificationRule},
    },
    signing::{ReplayGuard, SIGNATURE_HEADER, TIMESTAMP_HEADER, sign},
};

pub const EVENT_ID_HEADER: &str = "X-Webhook-Event-Id";
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

const USER_AGENT: &str = concat!("outbox-dispatcher/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Global signing secret plus optional named secrets selected per rule.
#[derive(Clone, Default)]
pub struct SigningSecrets {
    default: Option<String>,
    named: HashMap<String, String>,
}

impl SigningSecrets {
    pub fn new(default: Option<String>) -> Self {
        Self {
            default: default.filter(|s| !s.is_empty()),
            named: HashMap::new(),
        }
    }

    pub fn with_named(mut self, name: impl Into<String>, secret: impl Into<String>) -> Self {
        self.named.insert(name.into(), secret.into());
        self
    }

    /// `None` means the request goes out unsigned.
    ///
    /// A reference to an unknown secret is a rule misconfiguration; it is not
    /// silently downgraded to the global secret.
    pub fn resolve(&self, secret_ref: Option<&str>) -> Result<Option<&str>, DeliveryError> {
        match secret_ref {
            Some(name) => self
                .named
                .get(name)
                .map(|secret| Some(secret.as_str()))
                .ok_or_else(|| {
                    DeliveryError::InvalidConfig(format!("unknown signing secret '{}'", name))
                }),
            None => Ok(self.default.as_deref()),
        }
    }
}

/// Signed JSON POST to a rule's URL, gated by the egress filter.
#[derive(Clone)]
pub struct WebhookAdapter {
    egress: Arc<EgressFilter>,
    secrets: SigningSecrets,
    replay_guard: Option<ReplayGuard>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl WebhookAdapter {
    pub fn new(
        egress: Arc<EgressFilter>,
        secrets: SigningSecrets,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            egress,
            secrets,
            replay_guard: None,
            clock,
            timeout,
        }
    }

    pub fn with_replay_guard(mut self, guard: ReplayGuard) -> Self {
        self.replay_guard = Some(guard);
        self
    }

    /// Builds a client that connects only to the addresses the filter vetted,
    /// so a second DNS answer cannot redirect the request.
    fn client_for(&self, vetted: &VettedDestination) -> Result<Client, DeliveryError> {
        let mut builder = Client::builder()
            .timeout(self.timeout)
            .redirect(Policy::none())
            .user_agent(USER_AGENT);

        if vetted.is_domain() {
            builder = builder.resolve_to_addrs(&vetted.host, &vetted.addrs);
        }

        builder
            .build()
            .map_err(|e| DeliveryError::Network(format!("failed to build HTTP client: {}", e)))
    }

    async fn post(&self, rule: &NotificationRule, event: &OutboxEvent) -> Result<(), DeliveryError> {
        let url = rule
            .config
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                DeliveryError::InvalidConfig(format!("webhook rule {} has no url", rule.id))
            })?;

        let vetted = self.egress.check(url).await?;
        let body = serde_json::to_vec(&event.payload)
            .map_err(|e| DeliveryError::InvalidConfig(format!("unserializable payload: {}", e)))?;
        let timestamp = self.clock.now().timestamp();

        let mut request = self
            .client_for(&vetted)?
            .post(vetted.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(EVENT_ID_HEADER, event.id.to_string())
            .header(ATTEMPT_HEADER, event.attempts.saturating_add(1).to_string());

        if let Some(secret) = self.secrets.resolve(rule.config.secret_ref.as_deref())? {
            let signature = sign(secret, timestamp, &body)
                .map_err(|e| DeliveryError::Signing(e.to_string()))?;

            if let Some(guard) = &self.replay_guard {
                match guard.record_issued(url, timestamp, &signature).await {
                    Ok(true) => {}
                    Ok(false) => debug!(event_id = %event.id, "Signature already issued in window"),
                    Err(e) => warn!(error = %e, "Failed to record issued signature"),
                }
            }

            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(self.timeout)
            } else {
                DeliveryError::from(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(event_id = %event.id, status = status.as_u16(), "Webhook accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::HttpStatus {
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        })
    }
}

impl ChannelAdapter for WebhookAdapter {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    fn deliver<'a>(
        &'a self,
        rule: &'a NotificationRule,
        event: &'a OutboxEvent,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        self.post(rule, event).boxed()
    }
}
