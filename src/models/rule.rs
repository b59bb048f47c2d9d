use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use anyhow::{Error, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery channel a rule routes its events through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Console,
    Webhook,
    Whatsapp,
    Sms,
    Slack,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Console,
        Channel::Webhook,
        Channel::Whatsapp,
        Channel::Sms,
        Channel::Slack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Console => "console",
            Channel::Webhook => "webhook",
            Channel::Whatsapp => "whatsapp",
            Channel::Sms => "sms",
            Channel::Slack => "slack",
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|channel| channel.as_str() == s)
            .ok_or_else(|| anyhow!("Unknown notification channel '{}'", s))
    }
}

/// Channel-specific settings stored alongside a rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Recipient address for chat/SMS channels (phone number, chat id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Endpoint for the webhook channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Name of the signing secret to use instead of the global one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Business event the rule subscribes to, e.g. `order.ready`.
    pub event: String,
    pub channel: Channel,
    pub config: RuleConfig,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl NotificationRule {
    pub fn new(tenant_id: Uuid, event: impl Into<String>, channel: Channel) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            event: event.into(),
            channel,
            config: RuleConfig::default(),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.config.url = Some(url.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.config.target = Some(target.into());
        self
    }

    pub fn with_secret_ref(mut self, secret_ref: impl Into<String>) -> Self {
        self.config.secret_ref = Some(secret_ref.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Human-readable address the rule delivers to, as recorded in dead letters.
    pub fn target(&self) -> String {
        match self.channel {
            Channel::Webhook => self.config.url.clone().unwrap_or_default(),
            Channel::Console => self
                .config
                .target
                .clone()
                .unwrap_or_else(|| format!("tenant:{}", self.tenant_id)),
            _ => self.config.target.clone().unwrap_or_default(),
        }
    }
}
