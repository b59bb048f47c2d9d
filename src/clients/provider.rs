use futures_util::{FutureExt, future::BoxFuture};
use tracing::info;

use crate::{
    clients::adapter::ChannelAdapter,
    error::DeliveryError,
    models::{
        event::OutboxEvent,
        rule::{Channel, NotificationRule},
    },
};

/// Stand-in for chat/SMS vendors (WhatsApp, SMS, Slack).
///
/// Validates that the rule names a recipient and logs the hand-off. Vendor
/// wire formats are not implemented.
#[derive(Debug, Clone, Copy)]
pub struct ProviderAdapter {
    channel: Channel,
}

impl ProviderAdapter {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

impl ChannelAdapter for ProviderAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn deliver<'a>(
        &'a self,
        rule: &'a NotificationRule,
        event: &'a OutboxEvent,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        async move {
            let target = rule
                .config
                .target
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| {
                    DeliveryError::InvalidConfig(format!(
                        "{} rule {} has no target",
                        self.channel, rule.id
                    ))
                })?;

            info!(
                channel = %self.channel,
                rule_id = %rule.id,
                event_id = %event.id,
                target_len = target.len(),
                "Provider delivery handed off (stub)"
            );

            Ok(())
        }
        .boxed()
    }
}
