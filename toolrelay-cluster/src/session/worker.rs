use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use toolrelay_core::models::channel;
use toolrelay_core::{RequestEnvelope, RequestId, ResponseEnvelope, SessionId};
use tracing::{debug, error, info, warn};

use crate::broker::{SharedBroker, Subscription};
use crate::handler::{SessionContext, SharedHandler};
use crate::transport::{response_channel, CompletionError, TransportKind, TransportRequest};

/// Handler-side consumer of `requests:{sessionId}`
#[derive(Clone)]
pub(super) struct Worker {
    pub(super) session_id: SessionId,
    pub(super) broker: SharedBroker,
    pub(super) handler: SharedHandler,
    pub(super) request_timeout: Duration,
    pub(super) cancel: CancellationToken,
}

impl Worker {
    /// Consume request envelopes until cancelled or unsubscribed. Each
    /// request runs in its own task.
    pub(super) async fn run(self, mut requests: Subscription) {
        debug!(session_id = %self.session_id, "Session worker started");
        loop {
            let payload = tokio::select! {
                () = self.cancel.cancelled() => break,
                payload = requests.recv() => payload,
            };
            let Some(payload) = payload else {
                warn!(session_id = %self.session_id, "Request channel closed");
                break;
            };
            tokio::spawn(self.clone().process(payload));
        }
        debug!(session_id = %self.session_id, "Session worker stopped");
    }

    async fn process(self, payload: String) {
        let envelope = match RequestEnvelope::from_json(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                if let Some(request_id) = RequestEnvelope::salvage_request_id(&payload) {
                    warn!(
                        session_id = %self.session_id,
                        request_id = %request_id,
                        error = %e,
                        "Malformed request envelope"
                    );
                    self.reply(
                        &request_id,
                        ResponseEnvelope::error(400, format!("Malformed request envelope: {e}")),
                    )
                    .await;
                } else {
                    warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "Dropping unparsable request envelope"
                    );
                }
                return;
            }
        };

        let request_id = envelope.request_id.clone();
        let request = match TransportRequest::from_envelope(&envelope) {
            Ok(request) => request.with_close_signal(self.cancel.child_token()),
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    request_id = %request_id,
                    error = %e,
                    "Invalid request envelope"
                );
                self.reply(&request_id, ResponseEnvelope::error(400, e.to_string()))
                    .await;
                return;
            }
        };

        let started = Instant::now();
        let response = self.invoke(&request_id, request).await;
        let Some(response) = response else {
            return;
        };

        debug!(
            session_id = %self.session_id,
            request_id = %request_id,
            status = response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request handled"
        );
        self.reply(&request_id, response).await;
    }

    /// Run the handler against a captured response. `None` when the handler
    /// did not finish in time: nothing is published and the caller times out.
    async fn invoke(
        &self,
        request_id: &RequestId,
        request: TransportRequest,
    ) -> Option<ResponseEnvelope> {
        let deadline = Instant::now() + self.request_timeout;
        let (writer, handle) = response_channel(TransportKind::Captured);
        let Some(completion) = handle.into_captured() else {
            error!(request_id = %request_id, "Factory returned a non-captured response handle");
            return Some(ResponseEnvelope::error(500, "Internal transport error"));
        };

        let ctx = SessionContext::new(self.session_id.clone(), self.broker.clone());
        let handler = self.handler.clone();
        let mut task = tokio::spawn(async move { handler.handle(ctx, request, writer).await });

        match completion.wait(self.request_timeout).await {
            Ok(captured) => {
                // Surface handler errors raised after the response was ended.
                tokio::spawn(log_late_failure(
                    self.session_id.clone(),
                    request_id.clone(),
                    task,
                ));
                Some(captured.into_envelope())
            }
            Err(CompletionError::Dropped) => {
                let message = match tokio::time::timeout_at(deadline, &mut task).await {
                    Ok(Ok(Ok(()))) => "Handler finished without ending the response".to_string(),
                    Ok(Ok(Err(e))) => e.to_string(),
                    Ok(Err(join_error)) if join_error.is_panic() => "Handler panicked".to_string(),
                    Ok(Err(_)) => "Handler was cancelled".to_string(),
                    Err(_) => {
                        task.abort();
                        "Response dropped before completion".to_string()
                    }
                };
                error!(
                    session_id = %self.session_id,
                    request_id = %request_id,
                    error = %message,
                    "Handler failed"
                );
                Some(ResponseEnvelope::error(500, message))
            }
            Err(CompletionError::TimedOut) => {
                task.abort();
                warn!(
                    session_id = %self.session_id,
                    request_id = %request_id,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Handler did not complete in time"
                );
                None
            }
        }
    }

    /// Publish the response envelope. Failures leave the caller to time out.
    async fn reply(&self, request_id: &RequestId, response: ResponseEnvelope) {
        let payload = match response.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(request_id = %request_id, error = %e, "Failed to serialize response envelope");
                return;
            }
        };

        let reply_channel = channel::responses(&self.session_id, request_id);
        match self.broker.publish(&reply_channel, &payload).await {
            Ok(0) => info!(
                session_id = %self.session_id,
                request_id = %request_id,
                "No caller waiting for response"
            ),
            Ok(_) => {}
            Err(e) => error!(
                session_id = %self.session_id,
                request_id = %request_id,
                error = %e,
                "Failed to publish response envelope"
            ),
        }
    }
}

async fn log_late_failure(
    session_id: SessionId,
    request_id: RequestId,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(
            session_id = %session_id,
            request_id = %request_id,
            error = %e,
            "Handler failed after ending the response"
        ),
        Err(join_error) => warn!(
            session_id = %session_id,
            request_id = %request_id,
            error = %join_error,
            "Handler task aborted after ending the response"
        ),
    }
}
