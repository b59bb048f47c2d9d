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

/// Writes notifications to the structured log. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleAdapter;

impl ChannelAdapter for ConsoleAdapter {
    fn channel(&self) -> Channel {
        Channel::Console
    }

    fn deliver<'a>(
        &'a self,
        rule: &'a NotificationRule,
        event: &'a OutboxEvent,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        async move {
            info!(
                target: "notifications::console",
                tenant_id = %rule.tenant_id,
                rule_id = %rule.id,
                event_id = %event.id,
                event = %rule.event,
                payload = %event.payload,
                "Notification"
            );
            Ok(())
        }
        .boxed()
    }
}
