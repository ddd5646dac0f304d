use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{CompletionError, ResponseWriter};

type Head = (StatusCode, HeaderMap);

/// Writer forwarding the head and each chunk to a live HTTP body
#[derive(Debug)]
pub struct StreamedResponse {
    head: Option<oneshot::Sender<Head>>,
    body: Option<mpsc::UnboundedSender<Bytes>>,
}

impl StreamedResponse {
    #[must_use]
    pub fn new() -> (Self, LiveResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let writer = Self {
            head: Some(head_tx),
            body: Some(body_tx),
        };
        (
            writer,
            LiveResponse {
                head: head_rx,
                body: body_rx,
            },
        )
    }

    fn ensure_head(&mut self) {
        if self.head.is_some() {
            self.write_head(StatusCode::OK, HeaderMap::new());
        }
    }
}

impl ResponseWriter for StreamedResponse {
    fn write_head(&mut self, status: StatusCode, headers: HeaderMap) {
        if let Some(head) = self.head.take() {
            let _ = head.send((status, headers));
        }
    }

    fn write(&mut self, chunk: Bytes) {
        if self.body.is_none() {
            return;
        }
        self.ensure_head();
        if let Some(body) = &self.body {
            if body.send(chunk).is_err() {
                // Client went away; stop forwarding.
                self.body = None;
            }
        }
    }

    fn end(&mut self, chunk: Option<Bytes>) {
        if let Some(chunk) = chunk {
            self.write(chunk);
        }
        self.ensure_head();
        self.body = None;
    }

    fn is_finished(&self) -> bool {
        self.body.is_none()
    }
}

/// Receiving side of a [`StreamedResponse`]
#[derive(Debug)]
pub struct LiveResponse {
    head: oneshot::Receiver<Head>,
    body: mpsc::UnboundedReceiver<Bytes>,
}

impl LiveResponse {
    /// Wait for the head, then hand back the body as a stream that ends when
    /// the writer ends or is dropped.
    pub async fn into_parts(
        self,
        limit: Duration,
    ) -> Result<(StatusCode, HeaderMap, UnboundedReceiverStream<Bytes>), CompletionError> {
        match tokio::time::timeout(limit, self.head).await {
            Ok(Ok((status, headers))) => {
                Ok((status, headers, UnboundedReceiverStream::new(self.body)))
            }
            Ok(Err(_)) => Err(CompletionError::Dropped),
            Err(_) => Err(CompletionError::TimedOut),
        }
    }
}
