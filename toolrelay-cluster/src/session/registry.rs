use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toolrelay_core::metrics::ACTIVE_SESSIONS;
use toolrelay_core::models::channel;
use toolrelay_core::SessionId;
use tracing::{info, warn};

use super::worker::Worker;
use crate::broker::SharedBroker;
use crate::error::RelayError;
use crate::handler::SharedHandler;

/// Teardown state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

/// Snapshot of a registered session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
}

struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            created_at: self.created_at,
            state: *self.state.lock(),
        }
    }
}

/// Sessions hosted by this instance, each with a worker consuming its
/// request channel
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    broker: SharedBroker,
    request_timeout: Duration,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(broker: SharedBroker, request_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            broker,
            request_timeout,
        }
    }

    /// Create a session bound to `handler`.
    ///
    /// The worker's subscription to `requests:{sessionId}` is confirmed
    /// before the id is returned, so a request relayed with that id right
    /// away is not lost.
    pub async fn register(&self, handler: SharedHandler) -> Result<SessionId, RelayError> {
        let session_id = SessionId::new();
        let requests = self
            .broker
            .subscribe(&channel::requests(&session_id))
            .await?;

        let cancel = CancellationToken::new();
        let worker = Worker {
            session_id: session_id.clone(),
            broker: self.broker.clone(),
            handler,
            request_timeout: self.request_timeout,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run(requests));

        let session = Arc::new(Session {
            id: session_id.clone(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState::Active),
            cancel,
            worker: Mutex::new(Some(handle)),
        });
        self.sessions.insert(session_id.clone(), session);
        ACTIVE_SESSIONS.inc();

        info!(
            session_id = %session_id,
            active_sessions = self.sessions.len(),
            "Session registered"
        );
        Ok(session_id)
    }

    /// Stop the session's worker, unsubscribe its request channel and
    /// forget it.
    pub async fn deregister(&self, session_id: &SessionId) -> Result<(), RelayError> {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return Err(RelayError::SessionNotFound(session_id.clone()));
        };
        ACTIVE_SESSIONS.dec();
        *session.state.lock() = SessionState::Closing;

        session.cancel.cancel();
        let handle = session.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(session_id = %session_id, error = %e, "Session worker ended abnormally");
            }
        }

        if let Err(e) = self
            .broker
            .unsubscribe(&channel::requests(session_id))
            .await
        {
            warn!(session_id = %session_id, error = %e, "Failed to unsubscribe request channel");
        }

        *session.state.lock() = SessionState::Closed;
        info!(
            session_id = %session_id,
            active_sessions = self.sessions.len(),
            "Session deregistered"
        );
        Ok(())
    }

    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|session| session.info())
    }

    #[must_use]
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|entry| entry.value().info()).collect();
        sessions.sort_by_key(|info| info.created_at);
        sessions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Deregister every remaining session.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "Deregistering remaining sessions");
        for session_id in ids {
            // A concurrent teardown may have won the race.
            let _ = self.deregister(&session_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::handler::{ProtocolHandler, SessionContext};
    use crate::transport::{ResponseWriter, TransportRequest};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::StatusCode;
    use toolrelay_core::{RequestEnvelope, RequestId, ResponseEnvelope};

    struct Upper;

    #[async_trait]
    impl ProtocolHandler for Upper {
        async fn handle(
            &self,
            _ctx: SessionContext,
            request: TransportRequest,
            mut response: Box<dyn ResponseWriter>,
        ) -> anyhow::Result<()> {
            let body = String::from_utf8_lossy(request.body()).to_uppercase();
            response.write_head(StatusCode::OK, http::HeaderMap::new());
            response.end(Some(Bytes::from(body)));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ProtocolHandler for Failing {
        async fn handle(
            &self,
            _ctx: SessionContext,
            _request: TransportRequest,
            _response: Box<dyn ResponseWriter>,
        ) -> anyhow::Result<()> {
            anyhow::bail!("tool exploded")
        }
    }

    fn registry() -> (Arc<MemoryBroker>, SessionRegistry) {
        let broker = Arc::new(MemoryBroker::new());
        let registry = SessionRegistry::new(broker.clone(), Duration::from_secs(5));
        (broker, registry)
    }

    async fn roundtrip(
        broker: &MemoryBroker,
        session_id: &SessionId,
        payload: String,
        request_id: &RequestId,
    ) -> ResponseEnvelope {
        let mut reply = broker
            .subscribe(&channel::responses(session_id, request_id))
            .await
            .unwrap();
        assert_eq!(
            broker
                .publish(&channel::requests(session_id), &payload)
                .await
                .unwrap(),
            1
        );
        let raw = reply.recv().await.unwrap();
        ResponseEnvelope::from_json(&raw).unwrap()
    }

    fn envelope(request_id: &RequestId, body: &str) -> String {
        RequestEnvelope {
            request_id: request_id.clone(),
            url: "/mcp/message".to_string(),
            method: "POST".to_string(),
            body: body.to_string(),
            headers: Default::default(),
        }
        .to_json()
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_subscribes_before_returning() {
        let (broker, registry) = registry();
        let session_id = registry.register(Arc::new(Upper)).await.unwrap();

        assert!(broker.is_subscribed(&channel::requests(&session_id)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&session_id).unwrap().state, SessionState::Active);
    }

    #[tokio::test]
    async fn test_worker_answers_on_reply_channel() {
        let (broker, registry) = registry();
        let session_id = registry.register(Arc::new(Upper)).await.unwrap();
        let request_id = RequestId::new();

        let response =
            roundtrip(&broker, &session_id, envelope(&request_id, "hi"), &request_id).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "HI");
    }

    #[tokio::test]
    async fn test_handler_error_becomes_500() {
        let (broker, registry) = registry();
        let session_id = registry.register(Arc::new(Failing)).await.unwrap();
        let request_id = RequestId::new();

        let response =
            roundtrip(&broker, &session_id, envelope(&request_id, "{}"), &request_id).await;
        assert_eq!(response.status, 500);
        assert!(response.body.contains("tool exploded"));
    }

    #[tokio::test]
    async fn test_malformed_envelope_with_request_id_gets_400() {
        let (broker, registry) = registry();
        let session_id = registry.register(Arc::new(Upper)).await.unwrap();
        let request_id = RequestId::new();
        let payload = format!(r#"{{"requestId":"{request_id}","method":42}}"#);

        let response = roundtrip(&broker, &session_id, payload, &request_id).await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_deregister_unsubscribes_and_forgets() {
        let (broker, registry) = registry();
        let session_id = registry.register(Arc::new(Upper)).await.unwrap();

        registry.deregister(&session_id).await.unwrap();
        assert!(!broker.is_subscribed(&channel::requests(&session_id)));
        assert!(registry.get(&session_id).is_none());
        assert!(registry.is_empty());

        assert!(matches!(
            registry.deregister(&session_id).await,
            Err(RelayError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_deregisters_everything() {
        let (broker, registry) = registry();
        for _ in 0..3 {
            registry.register(Arc::new(Upper)).await.unwrap();
        }
        assert_eq!(registry.list().len(), 3);

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert_eq!(broker.subscription_count(), 0);
    }
}
