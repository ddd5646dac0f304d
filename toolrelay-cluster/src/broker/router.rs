use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Subscription;
use crate::error::BrokerError;

/// Local routing table from channel name to its single subscriber
#[derive(Clone, Default)]
pub struct ChannelRouter {
    routes: Arc<DashMap<String, mpsc::UnboundedSender<String>>>,
}

impl ChannelRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the local subscriber for `channel`.
    pub fn insert(&self, channel: &str) -> Result<Subscription, BrokerError> {
        match self.routes.entry(channel.to_string()) {
            Entry::Occupied(mut occupied) => {
                // A subscriber that was dropped without unsubscribing leaves a
                // closed sender behind; reclaim the slot.
                if !occupied.get().is_closed() {
                    return Err(BrokerError::AlreadySubscribed(channel.to_string()));
                }
                let (tx, rx) = mpsc::unbounded_channel();
                occupied.insert(tx);
                Ok(Subscription::new(channel, rx))
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::unbounded_channel();
                vacant.insert(tx);
                debug!(channel = %channel, "Local route added");
                Ok(Subscription::new(channel, rx))
            }
        }
    }

    /// Remove the route; the subscriber's `recv` then yields `None`.
    pub fn remove(&self, channel: &str) -> bool {
        let removed = self.routes.remove(channel).is_some();
        if removed {
            debug!(channel = %channel, "Local route removed");
        }
        removed
    }

    /// Deliver a payload to the local subscriber, if any.
    pub fn dispatch(&self, channel: &str, payload: String) -> bool {
        let delivered = match self.routes.get(channel) {
            Some(sender) => sender.send(payload).is_ok(),
            None => return false,
        };

        if !delivered {
            warn!(channel = %channel, "Subscriber dropped without unsubscribing, removing route");
            self.routes.remove_if(channel, |_, sender| sender.is_closed());
        }
        delivered
    }

    #[must_use]
    pub fn contains(&self, channel: &str) -> bool {
        self.routes.contains_key(channel)
    }

    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.routes.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
