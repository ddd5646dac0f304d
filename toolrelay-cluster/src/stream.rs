//! Streaming endpoint adapter
//!
//! One `StreamSession` per event-stream client. Opening it registers a
//! session, subscribes the session's event channel and queues the
//! `connection` frame. A pump task then forwards event payloads verbatim and
//! interleaves `ping` frames until the client goes away, the connection
//! reaches its maximum duration, or the server shuts down.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use toolrelay_core::config::RelayConfig;
use toolrelay_core::metrics::{ACTIVE_STREAMS, STREAMS_CLOSED_TOTAL};
use toolrelay_core::models::channel;
use toolrelay_core::models::{CloseReason, ControlFrame, SessionNotice};
use toolrelay_core::SessionId;
use tracing::{debug, info, warn};

use crate::broker::{SharedBroker, Subscription};
use crate::error::RelayError;
use crate::handler::SharedHandler;
use crate::session::SessionRegistry;

/// Frames buffered between the pump and a slow client
const FRAME_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub keepalive: Duration,
    /// Already reduced by the safety margin
    pub max_duration: Duration,
}

impl From<&RelayConfig> for StreamConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            keepalive: config.keepalive_interval(),
            max_duration: config.effective_max_duration(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Subscribed,
    Streaming,
    Closed(CloseReason),
}

pub struct StreamSession {
    session_id: SessionId,
    broker: SharedBroker,
    registry: SessionRegistry,
    state: Mutex<StreamState>,
    torn_down: AtomicBool,
    cancel: CancellationToken,
}

impl StreamSession {
    /// Register a session and start streaming to the returned receiver.
    ///
    /// Each item is one serialized frame. The first is always the
    /// `connection` frame carrying the session id. Dropping the receiver
    /// counts as a client abort.
    pub async fn open(
        registry: &SessionRegistry,
        broker: SharedBroker,
        handler: SharedHandler,
        config: StreamConfig,
        shutdown: CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::Receiver<String>), RelayError> {
        let session_id = registry.register(handler).await?;
        let session = Arc::new(Self {
            session_id: session_id.clone(),
            broker,
            registry: registry.clone(),
            state: Mutex::new(StreamState::Connecting),
            torn_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let events = match session.broker.subscribe(&channel::events(&session_id)).await {
            Ok(events) => events,
            Err(e) => {
                if let Err(deregister_err) = registry.deregister(&session_id).await {
                    warn!(session_id = %session_id, error = %deregister_err, "Failed to deregister session");
                }
                return Err(e.into());
            }
        };
        session.set_state(StreamState::Subscribed);

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let established = serde_json::to_string(&ControlFrame::established(session_id.clone()))
            .map_err(toolrelay_core::Error::from)?;
        // Fresh channel: cannot be full or closed yet.
        let _ = tx.try_send(established);

        info!(
            session_id = %session_id,
            max_duration_secs = config.max_duration.as_secs(),
            "Streaming connection established"
        );
        ACTIVE_STREAMS.inc();
        tokio::spawn(Arc::clone(&session).pump(events, tx, config, shutdown));
        Ok((session, rx))
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    fn set_state(&self, state: StreamState) {
        *self.state.lock() = state;
    }

    async fn pump(
        self: Arc<Self>,
        mut events: Subscription,
        tx: mpsc::Sender<String>,
        config: StreamConfig,
        shutdown: CancellationToken,
    ) {
        self.set_state(StreamState::Streaming);

        let deadline = tokio::time::sleep(config.max_duration);
        tokio::pin!(deadline);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + config.keepalive, config.keepalive);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // At most one frame waits for channel capacity. While it waits the
        // close conditions stay live, so a client that stops reading is
        // still torn down on time.
        let mut pending: Option<String> = None;

        let reason = loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tx.closed() => break CloseReason::ClientAbort,
                () = &mut deadline => break CloseReason::MaxDuration,
                () = shutdown.cancelled() => break CloseReason::Shutdown,
                permit = tx.reserve(), if pending.is_some() => {
                    let Ok(permit) = permit else {
                        break CloseReason::ClientAbort;
                    };
                    if let Some(frame) = pending.take() {
                        permit.send(frame);
                    }
                }
                _ = heartbeat.tick(), if pending.is_none() => {
                    match serde_json::to_string(&ControlFrame::ping()) {
                        Ok(ping) => pending = Some(ping),
                        Err(e) => {
                            warn!(session_id = %self.session_id, error = %e, "Failed to serialize ping");
                        }
                    }
                }
                payload = events.recv(), if pending.is_none() => {
                    let Some(payload) = payload else {
                        warn!(session_id = %self.session_id, "Event subscription ended unexpectedly");
                        break CloseReason::ServerError;
                    };
                    pending = Some(payload);
                }
            }
        };

        self.teardown(reason).await;
        // The client sees end-of-stream only after teardown finished.
        drop(tx);
    }

    /// Release everything the connection holds. Runs once; later calls
    /// return `false` and do nothing.
    pub async fn teardown(&self, reason: CloseReason) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            debug!(session_id = %self.session_id, reason = %reason, "Teardown already done");
            return false;
        }
        self.cancel.cancel();

        if let Err(e) = self
            .broker
            .unsubscribe(&channel::events(&self.session_id))
            .await
        {
            warn!(session_id = %self.session_id, error = %e, "Failed to unsubscribe event channel");
        }

        if let Err(e) = self.registry.deregister(&self.session_id).await {
            warn!(session_id = %self.session_id, error = %e, "Failed to deregister session");
        }

        let notice = SessionNotice::disconnected(self.session_id.clone(), reason);
        match serde_json::to_string(&notice) {
            Ok(payload) => {
                if let Err(e) = self
                    .broker
                    .publish(&channel::session(&self.session_id), &payload)
                    .await
                {
                    warn!(session_id = %self.session_id, error = %e, "Failed to publish disconnection notice");
                }
            }
            Err(e) => warn!(session_id = %self.session_id, error = %e, "Failed to serialize disconnection notice"),
        }

        self.set_state(StreamState::Closed(reason));
        ACTIVE_STREAMS.dec();
        STREAMS_CLOSED_TOTAL.with_label_values(&[reason.as_str()]).inc();
        info!(session_id = %self.session_id, reason = %reason, "Streaming connection closed");
        true
    }
}
