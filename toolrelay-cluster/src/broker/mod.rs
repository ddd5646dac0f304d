//! Broker channel abstraction
//!
//! Every stateless instance reaches the same broker. Publishing is
//! fire-and-forget; the receiver count it returns is advisory. Each broker
//! instance holds at most one local subscription per channel.

pub mod memory;
pub mod redis_pubsub;
pub mod router;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::BrokerError;

pub use memory::MemoryBroker;
pub use redis_pubsub::RedisBroker;
pub use router::ChannelRouter;

/// Named-channel publish/subscribe
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publish a payload, returning how many subscribers received it.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError>;

    /// Subscribe to a channel. Returns once the broker has confirmed the
    /// subscription, so a publish issued afterwards is guaranteed to be seen.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;

    /// Drop the local subscription for a channel.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError>;

    /// Stop background connection tasks. Called once on server shutdown.
    fn shutdown(&self) {}
}

pub type SharedBroker = Arc<dyn Broker>;

/// Receiving side of one channel subscription
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub(crate) fn new(channel: impl Into<String>, receiver: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            channel: channel.into(),
            receiver,
        }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the channel was unsubscribed.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

/// Build a broker from its URL and establish its connections.
///
/// Connection failure here is fatal for the caller: the relay cannot
/// operate without a broker.
pub async fn connect(url: &str) -> Result<SharedBroker, BrokerError> {
    let parsed = url::Url::parse(url).map_err(|e| BrokerError::InvalidUrl(e.to_string()))?;
    match parsed.scheme() {
        "memory" => {
            info!("Using in-process memory broker (single instance only)");
            Ok(Arc::new(MemoryBroker::new()))
        }
        "redis" | "rediss" => {
            let broker = RedisBroker::new(url)?;
            broker.connect().await?;
            info!("Redis broker connected");
            Ok(Arc::new(broker))
        }
        other => Err(BrokerError::InvalidUrl(format!(
            "unsupported broker scheme '{other}'"
        ))),
    }
}
