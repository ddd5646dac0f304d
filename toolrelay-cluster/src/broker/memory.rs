//! In-process broker for single-instance deployments and tests

use async_trait::async_trait;

use super::{Broker, ChannelRouter, Subscription};
use crate::error::BrokerError;

/// Broker whose channels live in this process only
#[derive(Clone, Default)]
pub struct MemoryBroker {
    router: ChannelRouter,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.router.contains(channel)
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.router.len()
    }

    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.router.channels()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError> {
        Ok(usize::from(self.router.dispatch(channel, payload.to_string())))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        self.router.insert(channel)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.router.remove(channel);
        Ok(())
    }
}
