//! Request/response relay
//!
//! Turns a unary request into a request envelope on `requests:{sessionId}`
//! and waits for the matching envelope on
//! `responses:{sessionId}:{requestId}`. The reply channel is subscribed
//! before publishing and unsubscribed exactly once afterwards, whether the
//! request resolved, timed out, failed, or the caller went away.

use dashmap::DashMap;
use http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use toolrelay_core::metrics::{RELAY_DURATION, RELAY_REQUESTS_TOTAL};
use toolrelay_core::models::channel;
use toolrelay_core::{RequestId, ResponseEnvelope, SessionId};
use tracing::{debug, warn};

use crate::broker::SharedBroker;
use crate::error::RelayError;
use crate::transport::TransportRequest;

/// Lifecycle of a relayed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Created,
    Published,
    Resolved,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub session_id: SessionId,
    pub state: PendingState,
    pub created_at: Instant,
    pub deadline: Instant,
}

/// The handler's answer as seen by the unary caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    pub status: StatusCode,
    pub body: String,
}

#[derive(Clone)]
pub struct Relay {
    broker: SharedBroker,
    request_timeout: Duration,
    pending: Arc<DashMap<RequestId, PendingRequest>>,
}

impl Relay {
    #[must_use]
    pub fn new(broker: SharedBroker, request_timeout: Duration) -> Self {
        Self {
            broker,
            request_timeout,
            pending: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Requests currently between creation and resolution
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Relay `request` to the worker of `session_id` and wait for its reply.
    pub async fn forward(
        &self,
        session_id: Option<&str>,
        request: &TransportRequest,
    ) -> Result<RelayResponse, RelayError> {
        let started = Instant::now();
        let result = self.relay(session_id, request).await;

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(response) => {
                RELAY_REQUESTS_TOTAL
                    .with_label_values(&["resolved", response.status.as_str()])
                    .inc();
                RELAY_DURATION.with_label_values(&["resolved"]).observe(elapsed);
            }
            Err(e) => {
                RELAY_REQUESTS_TOTAL
                    .with_label_values(&[e.outcome(), e.status_code().as_str()])
                    .inc();
                RELAY_DURATION.with_label_values(&[e.outcome()]).observe(elapsed);
            }
        }
        result
    }

    async fn relay(
        &self,
        session_id: Option<&str>,
        request: &TransportRequest,
    ) -> Result<RelayResponse, RelayError> {
        let raw = session_id
            .filter(|raw| !raw.is_empty())
            .ok_or(RelayError::MissingSession)?;
        let session_id =
            SessionId::parse(raw).map_err(|e| RelayError::InvalidSession(e.to_string()))?;

        let request_id = RequestId::new();
        let payload = request.to_envelope(request_id.clone()).to_json()?;

        let now = Instant::now();
        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                session_id: session_id.clone(),
                state: PendingState::Created,
                created_at: now,
                deadline: now + self.request_timeout,
            },
        );
        let _pending = PendingEntry {
            pending: &self.pending,
            request_id: request_id.clone(),
        };

        let reply_channel = channel::responses(&session_id, &request_id);
        let mut reply = self.broker.subscribe(&reply_channel).await?;
        let guard = ReplyGuard::new(self.broker.clone(), reply_channel);

        let receivers = match self
            .broker
            .publish(&channel::requests(&session_id), &payload)
            .await
        {
            Ok(receivers) => receivers,
            Err(e) => {
                guard.release().await;
                return Err(e.into());
            }
        };
        if receivers == 0 {
            guard.release().await;
            debug!(session_id = %session_id, request_id = %request_id, "No worker for session");
            return Err(RelayError::SessionNotFound(session_id));
        }
        self.set_state(&request_id, PendingState::Published);
        debug!(
            session_id = %session_id,
            request_id = %request_id,
            method = %request.method(),
            "Request published"
        );

        let outcome = tokio::time::timeout(self.request_timeout, reply.recv()).await;
        guard.release().await;

        match outcome {
            Ok(Some(raw)) => {
                self.set_state(&request_id, PendingState::Resolved);
                let envelope = ResponseEnvelope::from_json(&raw).map_err(|e| {
                    warn!(request_id = %request_id, error = %e, "Malformed response envelope");
                    RelayError::MalformedResponse(e.to_string())
                })?;
                let status = StatusCode::from_u16(envelope.status).map_err(|_| {
                    RelayError::MalformedResponse(format!("invalid status {}", envelope.status))
                })?;
                debug!(
                    session_id = %session_id,
                    request_id = %request_id,
                    status = status.as_u16(),
                    "Request resolved"
                );
                Ok(RelayResponse {
                    status,
                    body: envelope.body,
                })
            }
            Ok(None) => Err(RelayError::ReplyChannelClosed),
            Err(_) => {
                self.set_state(&request_id, PendingState::TimedOut);
                warn!(
                    session_id = %session_id,
                    request_id = %request_id,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(RelayError::Timeout {
                    request_id,
                    after: self.request_timeout,
                })
            }
        }
    }

    fn set_state(&self, request_id: &RequestId, state: PendingState) {
        if let Some(mut entry) = self.pending.get_mut(request_id) {
            debug!(request_id = %request_id, from = ?entry.state, to = ?state, "Pending request transition");
            entry.state = state;
        }
    }
}

/// Removes the pending entry when the relay call finishes or is dropped.
struct PendingEntry<'a> {
    pending: &'a DashMap<RequestId, PendingRequest>,
    request_id: RequestId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

/// Owns the reply subscription. `release` unsubscribes; dropping an
/// unreleased guard (caller disconnected mid-wait) unsubscribes in the
/// background.
struct ReplyGuard {
    broker: SharedBroker,
    channel: Option<String>,
}

impl ReplyGuard {
    fn new(broker: SharedBroker, channel: String) -> Self {
        Self {
            broker,
            channel: Some(channel),
        }
    }

    async fn release(mut self) {
        if let Some(channel) = self.channel.take() {
            unsubscribe_reply(&self.broker, &channel).await;
        }
    }
}

impl Drop for ReplyGuard {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        let broker = self.broker.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    unsubscribe_reply(&broker, &channel).await;
                });
            }
            Err(_) => warn!(channel = %channel, "No runtime to release reply subscription"),
        }
    }
}

async fn unsubscribe_reply(broker: &SharedBroker, channel: &str) {
    if let Err(e) = broker.unsubscribe(channel).await {
        warn!(channel = %channel, error = %e, "Failed to unsubscribe reply channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBroker, Subscription};
    use crate::error::BrokerError;
    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use tokio::sync::mpsc;

    fn request() -> TransportRequest {
        TransportRequest::new(
            Method::POST,
            "/mcp/message?sessionId=s1".parse().unwrap(),
            HeaderMap::new(),
            Bytes::from_static(br#"{"tool":"echo","args":{"message":"hi"}}"#),
        )
    }

    fn subscription_for(channel: &str) -> Subscription {
        let (_tx, rx) = mpsc::unbounded_channel();
        Subscription::new(channel, rx)
    }

    #[tokio::test]
    async fn test_missing_session_touches_no_broker() {
        // Any broker call would panic on the expectation-free mock.
        let relay = Relay::new(Arc::new(MockBroker::new()), Duration::from_secs(1));

        let err = relay.forward(None, &request()).await.unwrap_err();
        assert!(matches!(err, RelayError::MissingSession));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = relay.forward(Some(""), &request()).await.unwrap_err();
        assert!(matches!(err, RelayError::MissingSession));
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_session_id_rejected() {
        let relay = Relay::new(Arc::new(MockBroker::new()), Duration::from_secs(1));
        let err = relay.forward(Some("bad id"), &request()).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidSession(_)));
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_500_without_publish() {
        let mut broker = MockBroker::new();
        broker
            .expect_subscribe()
            .times(1)
            .returning(|_| Err(BrokerError::Connection("down".to_string())));
        broker.expect_publish().never();
        broker.expect_unsubscribe().never();

        let relay = Relay::new(Arc::new(broker), Duration::from_secs(1));
        let err = relay.forward(Some("s1"), &request()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_500_and_unsubscribes_once() {
        let mut broker = MockBroker::new();
        broker
            .expect_subscribe()
            .times(1)
            .returning(|channel| Ok(subscription_for(channel)));
        broker
            .expect_publish()
            .times(1)
            .returning(|_, _| Err(BrokerError::Timeout("publish")));
        broker
            .expect_unsubscribe()
            .withf(|channel| channel.starts_with("responses:s1:"))
            .times(1)
            .returning(|_| Ok(()));

        let relay = Relay::new(Arc::new(broker), Duration::from_secs(1));
        let err = relay.forward(Some("s1"), &request()).await.unwrap_err();
        assert!(matches!(err, RelayError::Broker(BrokerError::Timeout("publish"))));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_no_receivers_is_session_not_found() {
        let mut broker = MockBroker::new();
        broker
            .expect_subscribe()
            .times(1)
            .returning(|channel| Ok(subscription_for(channel)));
        broker
            .expect_publish()
            .withf(|channel, _| channel.starts_with("requests:") && channel.ends_with(":s1"))
            .times(1)
            .returning(|_, _| Ok(0));
        broker.expect_unsubscribe().times(1).returning(|_| Ok(()));

        let relay = Relay::new(Arc::new(broker), Duration::from_secs(1));
        let err = relay.forward(Some("s1"), &request()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_published_payload_is_request_envelope() {
        let mut broker = MockBroker::new();
        broker
            .expect_subscribe()
            .times(1)
            .returning(|channel| Ok(subscription_for(channel)));
        broker
            .expect_publish()
            .withf(|_, payload| {
                let envelope = toolrelay_core::RequestEnvelope::from_json(payload).unwrap();
                envelope.method == "POST"
                    && envelope.url == "/mcp/message?sessionId=s1"
                    && envelope.body.contains("echo")
            })
            .times(1)
            .returning(|_, _| Ok(0));
        broker.expect_unsubscribe().times(1).returning(|_| Ok(()));

        let relay = Relay::new(Arc::new(broker), Duration::from_secs(1));
        assert!(relay.forward(Some("s1"), &request()).await.is_err());
    }
}
