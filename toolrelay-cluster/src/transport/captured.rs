use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use std::time::Duration;
use tokio::sync::oneshot;
use toolrelay_core::ResponseEnvelope;

use super::{CompletionError, ResponseWriter};

/// A finished in-memory response
#[derive(Debug, Clone)]
pub struct Captured {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Captured {
    #[must_use]
    pub fn into_envelope(self) -> ResponseEnvelope {
        ResponseEnvelope::new(
            self.status.as_u16(),
            String::from_utf8_lossy(&self.body).into_owned(),
        )
    }
}

/// Writer that buffers everything and reports once on `end()`
#[derive(Debug)]
pub struct CapturedResponse {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    done: Option<oneshot::Sender<Captured>>,
}

impl CapturedResponse {
    #[must_use]
    pub fn new() -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let writer = Self {
            status: None,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            done: Some(tx),
        };
        (writer, Completion { rx })
    }
}

impl ResponseWriter for CapturedResponse {
    fn write_head(&mut self, status: StatusCode, headers: HeaderMap) {
        if self.status.is_none() && self.done.is_some() {
            self.status = Some(status);
            self.headers = headers;
        }
    }

    fn write(&mut self, chunk: Bytes) {
        if self.done.is_none() {
            return;
        }
        self.status.get_or_insert(StatusCode::OK);
        self.body.extend_from_slice(&chunk);
    }

    fn end(&mut self, chunk: Option<Bytes>) {
        if let Some(chunk) = chunk {
            self.write(chunk);
        }
        let Some(done) = self.done.take() else {
            return;
        };
        let captured = Captured {
            status: self.status.unwrap_or(StatusCode::OK),
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body).freeze(),
        };
        // The waiting side may already have given up.
        let _ = done.send(captured);
    }

    fn is_finished(&self) -> bool {
        self.done.is_none()
    }
}

/// Resolves with the captured response once the writer ends
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Captured>,
}

impl Completion {
    pub async fn wait(self, limit: Duration) -> Result<Captured, CompletionError> {
        match tokio::time::timeout(limit, self.rx).await {
            Ok(Ok(captured)) => Ok(captured),
            Ok(Err(_)) => Err(CompletionError::Dropped),
            Err(_) => Err(CompletionError::TimedOut),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_head_and_body() {
        let (mut writer, completion) = CapturedResponse::new();
        writer.write_head(StatusCode::CREATED, HeaderMap::new());
        writer.write(Bytes::from_static(b"hel"));
        writer.end(Some(Bytes::from_static(b"lo")));
        assert!(writer.is_finished());

        let captured = completion.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(captured.status, StatusCode::CREATED);
        assert_eq!(captured.body, Bytes::from_static(b"hello"));

        let envelope = captured.into_envelope();
        assert_eq!(envelope.status, 201);
        assert_eq!(envelope.body, "hello");
    }

    #[tokio::test]
    async fn test_implicit_ok_status() {
        let (mut writer, completion) = CapturedResponse::new();
        writer.end(Some(Bytes::from_static(b"x")));
        let captured = completion.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(captured.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_writes_after_end_are_ignored() {
        let (mut writer, completion) = CapturedResponse::new();
        writer.end(Some(Bytes::from_static(b"first")));
        writer.write_head(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new());
        writer.end(Some(Bytes::from_static(b"second")));

        let captured = completion.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(captured.status, StatusCode::OK);
        assert_eq!(captured.body, Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn test_dropped_writer() {
        let (writer, completion) = CapturedResponse::new();
        drop(writer);
        assert_eq!(
            completion.wait(Duration::from_secs(1)).await.unwrap_err(),
            CompletionError::Dropped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ended_times_out() {
        let (_writer, completion) = CapturedResponse::new();
        assert_eq!(
            completion.wait(Duration::from_secs(10)).await.unwrap_err(),
            CompletionError::TimedOut
        );
    }
}
