//! The seam between the relay and server-side tool handling

use async_trait::async_trait;
use std::sync::Arc;
use toolrelay_core::models::channel;
use toolrelay_core::SessionId;
use tracing::debug;

use crate::broker::SharedBroker;
use crate::error::BrokerError;
use crate::transport::{ResponseWriter, TransportRequest};

/// Handles one protocol request.
///
/// Implementations must eventually call `end()` on the writer. Returning an
/// error before that turns into a `500` for the caller.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: SessionContext,
        request: TransportRequest,
        response: Box<dyn ResponseWriter>,
    ) -> anyhow::Result<()>;
}

pub type SharedHandler = Arc<dyn ProtocolHandler>;

/// Per-request view of the session a request belongs to
#[derive(Clone)]
pub struct SessionContext {
    session_id: Option<SessionId>,
    broker: Option<SharedBroker>,
}

impl SessionContext {
    #[must_use]
    pub fn new(session_id: SessionId, broker: SharedBroker) -> Self {
        Self {
            session_id: Some(session_id),
            broker: Some(broker),
        }
    }

    /// Context for requests served without a streaming session
    #[must_use]
    pub const fn stateless() -> Self {
        Self {
            session_id: None,
            broker: None,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Push a server-initiated message to the session's event stream.
    ///
    /// Returns `Ok(false)` when there is no session to deliver to.
    pub async fn emit(&self, message: &serde_json::Value) -> Result<bool, BrokerError> {
        let (Some(session_id), Some(broker)) = (&self.session_id, &self.broker) else {
            return Ok(false);
        };
        let receivers = broker
            .publish(&channel::events(session_id), &message.to_string())
            .await?;
        debug!(session_id = %session_id, receivers = receivers, "Event emitted");
        Ok(true)
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};

    #[tokio::test]
    async fn test_emit_publishes_on_event_channel() {
        let broker = Arc::new(MemoryBroker::new());
        let session_id = SessionId::new();
        let mut events = broker.subscribe(&channel::events(&session_id)).await.unwrap();

        let ctx = SessionContext::new(session_id, broker.clone());
        assert!(ctx.emit(&serde_json::json!({"method": "notifications/progress"})).await.unwrap());
        assert_eq!(
            events.recv().await.as_deref(),
            Some(r#"{"method":"notifications/progress"}"#)
        );
    }

    #[tokio::test]
    async fn test_stateless_emit_is_noop() {
        let ctx = SessionContext::stateless();
        assert!(ctx.session_id().is_none());
        assert!(!ctx.emit(&serde_json::json!({})).await.unwrap());
    }
}
