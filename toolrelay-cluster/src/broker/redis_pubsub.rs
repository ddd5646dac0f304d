//! Redis Pub/Sub broker
//!
//! Publishing goes through a `ConnectionManager`, which reconnects on its
//! own. Subscriptions share one dedicated Pub/Sub connection split into a
//! sink (SUBSCRIBE/UNSUBSCRIBE) and a message stream. A background
//! dispatcher drains the stream into the local `ChannelRouter`, and when the
//! connection drops it reconnects with exponential backoff and re-subscribes
//! every channel that still has a local route.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::{AsyncCommands, Client as RedisClient};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use toolrelay_core::metrics::BROKER_ERRORS_TOTAL;
use tracing::{debug, error, info, warn};

use super::{Broker, ChannelRouter, Subscription};
use crate::error::BrokerError;

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

type SharedSink = Arc<Mutex<Option<PubSubSink>>>;

pub struct RedisBroker {
    client: RedisClient,
    router: ChannelRouter,
    publisher: OnceCell<ConnectionManager>,
    /// Set once the Pub/Sub connection is open and its dispatcher runs
    dispatcher: OnceCell<()>,
    sink: SharedSink,
    cancel_token: CancellationToken,
}

impl RedisBroker {
    /// Create a broker for `redis_url`. No connection is made until
    /// [`RedisBroker::connect`].
    pub fn new(redis_url: &str) -> Result<Self, BrokerError> {
        let client = RedisClient::open(redis_url)
            .map_err(|e| BrokerError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            client,
            router: ChannelRouter::new(),
            publisher: OnceCell::new(),
            dispatcher: OnceCell::new(),
            sink: Arc::new(Mutex::new(None)),
            cancel_token: CancellationToken::new(),
        })
    }

    /// Open the publisher and Pub/Sub connections and start the dispatcher.
    /// Calling it again after success is a no-op.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.publisher
            .get_or_try_init(|| async {
                match timeout(
                    Duration::from_secs(REDIS_TIMEOUT_SECS),
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                {
                    Ok(Ok(manager)) => Ok(manager),
                    Ok(Err(e)) => Err(BrokerError::Connection(format!(
                        "failed to open publisher connection: {e}"
                    ))),
                    Err(_) => Err(BrokerError::Timeout("publisher connect")),
                }
            })
            .await?;

        self.dispatcher
            .get_or_try_init(|| async {
                let (sink, stream) = open_pubsub(&self.client).await?;
                *self.sink.lock().await = Some(sink);

                tokio::spawn(run_dispatcher(
                    self.client.clone(),
                    self.router.clone(),
                    Arc::clone(&self.sink),
                    stream,
                    self.cancel_token.clone(),
                ));
                Ok::<(), BrokerError>(())
            })
            .await?;

        Ok(())
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.router.len()
    }

    fn publisher(&self) -> Result<ConnectionManager, BrokerError> {
        self.publisher
            .get()
            .cloned()
            .ok_or_else(|| BrokerError::Connection("broker not connected".to_string()))
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError> {
        let mut conn = self.publisher()?;
        let result = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish::<_, _, usize>(channel, payload),
        )
        .await
        {
            Ok(Ok(receivers)) => Ok(receivers),
            Ok(Err(e)) => Err(BrokerError::Redis(e)),
            Err(_) => Err(BrokerError::Timeout("publish")),
        };

        match &result {
            Ok(receivers) => debug!(channel = %channel, receivers = receivers, "Published"),
            Err(e) => {
                BROKER_ERRORS_TOTAL.with_label_values(&["publish"]).inc();
                error!(error = %e, channel = %channel, "Failed to publish");
            }
        }
        result
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        // Route first so nothing delivered right after the SUBSCRIBE
        // confirmation can slip past.
        let subscription = self.router.insert(channel)?;

        let mut guard = self.sink.lock().await;
        let result = match guard.as_mut() {
            Some(sink) => {
                let result = match timeout(
                    Duration::from_secs(REDIS_TIMEOUT_SECS),
                    sink.subscribe(channel),
                )
                .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(BrokerError::Redis(e)),
                    Err(_) => Err(BrokerError::Timeout("subscribe")),
                };
                // The SUBSCRIBE may still land after a timeout. Undo it so
                // the server does not keep delivering to a dead route.
                if result.is_err() {
                    match timeout(
                        Duration::from_secs(REDIS_TIMEOUT_SECS),
                        sink.unsubscribe(channel),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(error = %e, channel = %channel, "Cleanup UNSUBSCRIBE failed"),
                        Err(_) => debug!(channel = %channel, "Cleanup UNSUBSCRIBE timed out"),
                    }
                }
                result
            }
            None => Err(BrokerError::Connection(
                "Pub/Sub connection unavailable".to_string(),
            )),
        };
        drop(guard);

        match result {
            Ok(()) => {
                debug!(channel = %channel, "Subscribed");
                Ok(subscription)
            }
            Err(e) => {
                self.router.remove(channel);
                BROKER_ERRORS_TOTAL.with_label_values(&["subscribe"]).inc();
                error!(error = %e, channel = %channel, "Failed to subscribe");
                Err(e)
            }
        }
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        if !self.router.remove(channel) {
            return Ok(());
        }

        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            // Disconnected: the channel is not re-subscribed since its route is gone.
            return Ok(());
        };

        match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            sink.unsubscribe(channel),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!(channel = %channel, "Unsubscribed");
                Ok(())
            }
            Ok(Err(e)) => {
                BROKER_ERRORS_TOTAL.with_label_values(&["unsubscribe"]).inc();
                warn!(error = %e, channel = %channel, "Failed to unsubscribe");
                Err(BrokerError::Redis(e))
            }
            Err(_) => {
                BROKER_ERRORS_TOTAL.with_label_values(&["unsubscribe"]).inc();
                warn!(channel = %channel, "Timed out unsubscribing");
                Err(BrokerError::Timeout("unsubscribe"))
            }
        }
    }

    /// Stop the dispatcher. Local subscriptions end once their routes are
    /// dropped.
    fn shutdown(&self) {
        info!("Shutting down Redis broker");
        self.cancel_token.cancel();
    }
}

async fn open_pubsub(client: &RedisClient) -> Result<(PubSubSink, PubSubStream), BrokerError> {
    match timeout(
        Duration::from_secs(REDIS_TIMEOUT_SECS),
        client.get_async_pubsub(),
    )
    .await
    {
        Ok(Ok(pubsub)) => Ok(pubsub.split()),
        Ok(Err(e)) => Err(BrokerError::Connection(format!(
            "failed to open Pub/Sub connection: {e}"
        ))),
        Err(_) => Err(BrokerError::Timeout("Pub/Sub connect")),
    }
}

/// Drain the message stream into the router, reconnecting when it ends.
async fn run_dispatcher(
    client: RedisClient,
    router: ChannelRouter,
    sink: SharedSink,
    mut stream: PubSubStream,
    cancel_token: CancellationToken,
) {
    loop {
        loop {
            let msg = tokio::select! {
                () = cancel_token.cancelled() => {
                    info!("Redis dispatcher cancelled");
                    return;
                }
                msg = stream.next() => msg,
            };
            let Some(msg) = msg else { break };

            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Invalid payload");
                    continue;
                }
            };
            if !router.dispatch(&channel, payload) {
                debug!(channel = %channel, "Message for channel without local route");
            }
        }

        // Stream returned None -- the Pub/Sub connection was lost
        sink.lock().await.take();
        BROKER_ERRORS_TOTAL.with_label_values(&["disconnect"]).inc();
        error!("Redis Pub/Sub stream ended (connection lost), reconnecting");

        match reconnect(&client, &router, &sink, &cancel_token).await {
            Some(next) => stream = next,
            None => return,
        }
    }
}

/// Reconnect with exponential backoff and re-subscribe every routed channel.
/// Returns `None` when cancelled.
async fn reconnect(
    client: &RedisClient,
    router: &ChannelRouter,
    sink: &SharedSink,
    cancel_token: &CancellationToken,
) -> Option<PubSubStream> {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Redis dispatcher cancelled during backoff");
                return None;
            }
            () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
        }

        match open_pubsub(client).await {
            Ok((mut new_sink, stream)) => {
                let channels = router.channels();
                let mut resubscribed = true;
                for channel in &channels {
                    match timeout(
                        Duration::from_secs(REDIS_TIMEOUT_SECS),
                        new_sink.subscribe(channel.as_str()),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(error = %e, channel = %channel, "Failed to re-subscribe");
                            resubscribed = false;
                            break;
                        }
                        Err(_) => {
                            error!(channel = %channel, "Timed out re-subscribing");
                            resubscribed = false;
                            break;
                        }
                    }
                }

                if resubscribed {
                    *sink.lock().await = Some(new_sink);
                    info!(channels = channels.len(), "Redis Pub/Sub reconnected");
                    return Some(stream);
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    backoff_secs = backoff_secs,
                    "Redis Pub/Sub failed to reconnect, retrying after backoff"
                );
            }
        }

        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_rejected() {
        assert!(matches!(
            RedisBroker::new("not-a-redis-url"),
            Err(BrokerError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let broker = RedisBroker::new("redis://127.0.0.1:6379").unwrap();
        assert!(matches!(
            broker.publish("requests:x", "{}").await,
            Err(BrokerError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_leaves_no_route() {
        let broker = RedisBroker::new("redis://127.0.0.1:6379").unwrap();
        assert!(broker.subscribe("events:x").await.is_err());
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_round_trip_through_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let broker = RedisBroker::new(&url).unwrap();
        broker.connect().await.unwrap();

        let mut sub = broker.subscribe("responses:test:round-trip").await.unwrap();
        let receivers = broker
            .publish("responses:test:round-trip", r#"{"status":200,"body":"ok"}"#)
            .await
            .unwrap();
        assert_eq!(receivers, 1);
        assert_eq!(
            sub.recv().await.as_deref(),
            Some(r#"{"status":200,"body":"ok"}"#)
        );

        broker.unsubscribe("responses:test:round-trip").await.unwrap();
        assert!(sub.recv().await.is_none());
        broker.shutdown();
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_connect_twice_keeps_one_pubsub_connection() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let broker = RedisBroker::new(&url).unwrap();
        broker.connect().await.unwrap();
        broker.connect().await.unwrap();

        let channel = "events:test:connect-twice";
        let mut sub = broker.subscribe(channel).await.unwrap();
        assert_eq!(broker.publish(channel, "once").await.unwrap(), 1);
        assert_eq!(sub.recv().await.as_deref(), Some("once"));
        assert!(
            timeout(Duration::from_millis(200), sub.recv()).await.is_err(),
            "payload must be delivered exactly once"
        );

        broker.unsubscribe(channel).await.unwrap();
        broker.shutdown();
    }
}
