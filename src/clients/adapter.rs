use std::{collections::HashMap, sync::Arc};

use futures_util::future::BoxFuture;

use crate::{
    clients::{console::ConsoleAdapter, provider::ProviderAdapter, webhook::WebhookAdapter},
    error::DeliveryError,
    models::{
        event::OutboxEvent,
        rule::{Channel, NotificationRule},
    },
};

/// A delivery mechanism for one channel.
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Identity the circuit breaker and metrics track this delivery under.
    fn destination(&self, rule: &NotificationRule) -> String {
        format!("{}:{}", rule.channel, rule.target())
    }

    fn deliver<'a>(
        &'a self,
        rule: &'a NotificationRule,
        event: &'a OutboxEvent,
    ) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

/// Channel-to-adapter table, fixed at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One adapter per channel; vendor channels get the logging stub.
    pub fn standard(webhook: WebhookAdapter) -> Self {
        let webhook: Arc<dyn ChannelAdapter> = Arc::new(webhook);

        Channel::ALL
            .into_iter()
            .fold(Self::new(), |registry, channel| {
                let adapter: Arc<dyn ChannelAdapter> = match channel {
                    Channel::Console => Arc::new(ConsoleAdapter),
                    Channel::Webhook => Arc::clone(&webhook),
                    Channel::Whatsapp | Channel::Sms | Channel::Slack => {
                        Arc::new(ProviderAdapter::new(channel))
                    }
                };
                registry.register(adapter)
            })
    }

    /// Adds or replaces the adapter for the adapter's own channel.
    pub fn register(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.channel(), adapter);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }
}
