//! Synthetic transport objects
//!
//! The protocol handler sees a narrow request/response pair instead of a
//! live HTTP exchange. Requests are rebuilt from broker envelopes; responses
//! are either captured in memory (relayed requests) or streamed to a real
//! HTTP body (direct requests). [`response_channel`] picks the variant.

mod captured;
mod streamed;

use bytes::Bytes;
use futures::Stream;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode, Uri};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use toolrelay_core::{Error, HeaderField, RequestEnvelope, RequestId, Result};

pub use captured::{Captured, CapturedResponse, Completion};
pub use streamed::{LiveResponse, StreamedResponse};

/// Why a response never completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("response writer dropped before end()")]
    Dropped,
    #[error("response not completed in time")]
    TimedOut,
}

/// Writer variant to hand the protocol handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Buffered in memory and delivered through a [`Completion`]
    Captured,
    /// Forwarded chunk by chunk to a live HTTP body
    Streamed,
}

/// Completion side matching a writer from [`response_channel`]
#[derive(Debug)]
pub enum ResponseHandle {
    Captured(Completion),
    Live(LiveResponse),
}

impl ResponseHandle {
    #[must_use]
    pub fn into_captured(self) -> Option<Completion> {
        match self {
            Self::Captured(completion) => Some(completion),
            Self::Live(_) => None,
        }
    }

    #[must_use]
    pub fn into_live(self) -> Option<LiveResponse> {
        match self {
            Self::Live(live) => Some(live),
            Self::Captured(_) => None,
        }
    }
}

/// Create a response writer and its completion handle.
#[must_use]
pub fn response_channel(kind: TransportKind) -> (Box<dyn ResponseWriter>, ResponseHandle) {
    match kind {
        TransportKind::Captured => {
            let (writer, completion) = CapturedResponse::new();
            (Box::new(writer), ResponseHandle::Captured(completion))
        }
        TransportKind::Streamed => {
            let (writer, live) = StreamedResponse::new();
            (Box::new(writer), ResponseHandle::Live(live))
        }
    }
}

/// The response surface a protocol handler writes to
pub trait ResponseWriter: Send {
    /// Set status and headers. Only the first call has effect.
    fn write_head(&mut self, status: StatusCode, headers: HeaderMap);

    /// Append a body chunk, implying `200` if no head was written.
    fn write(&mut self, chunk: Bytes);

    /// Finish the response, optionally with a last chunk.
    fn end(&mut self, chunk: Option<Bytes>);

    fn is_finished(&self) -> bool;

    /// Write a complete JSON response.
    fn send_json(&mut self, status: StatusCode, value: &serde_json::Value) {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.write_head(status, headers);
        self.end(Some(Bytes::from(value.to_string())));
    }

    /// Finish with a status and no body.
    fn send_status(&mut self, status: StatusCode) {
        self.write_head(status, HeaderMap::new());
        self.end(None);
    }
}

/// Inbound request as seen by the protocol handler
#[derive(Debug, Clone)]
pub struct TransportRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    closed: CancellationToken,
}

impl TransportRequest {
    #[must_use]
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            closed: CancellationToken::new(),
        }
    }

    /// Tie the request's close signal to an outer token.
    #[must_use]
    pub fn with_close_signal(mut self, closed: CancellationToken) -> Self {
        self.closed = closed;
        self
    }

    /// Rebuild a request from its broker envelope.
    pub fn from_envelope(envelope: &RequestEnvelope) -> Result<Self> {
        let method = Method::from_bytes(envelope.method.as_bytes())
            .map_err(|_| Error::InvalidInput(format!("invalid method '{}'", envelope.method)))?;
        let uri = envelope
            .url
            .parse::<Uri>()
            .map_err(|e| Error::InvalidInput(format!("invalid url '{}': {e}", envelope.url)))?;

        let mut headers = HeaderMap::with_capacity(envelope.headers.len());
        for (name, field) in &envelope.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidInput(format!("invalid header name '{name}'")))?;
            for value in field.values() {
                let value = HeaderValue::from_bytes(&HeaderField::decode_value(value))
                    .map_err(|_| Error::InvalidInput(format!("invalid value for header '{name}'")))?;
                headers.append(name.clone(), value);
            }
        }

        Ok(Self::new(
            method,
            uri,
            headers,
            Bytes::from(envelope.body.clone()),
        ))
    }

    /// Serialize for publication under `request_id`.
    #[must_use]
    pub fn to_envelope(&self, request_id: RequestId) -> RequestEnvelope {
        let mut headers: BTreeMap<String, HeaderField> = BTreeMap::new();
        for (name, value) in &self.headers {
            let value = HeaderField::encode_value(value.as_bytes());
            match headers.entry(name.as_str().to_string()) {
                Entry::Occupied(mut entry) => entry.get_mut().push(value),
                Entry::Vacant(entry) => {
                    entry.insert(HeaderField::Single(value));
                }
            }
        }

        RequestEnvelope {
            request_id,
            url: self.uri.to_string(),
            method: self.method.as_str().to_string(),
            body: String::from_utf8_lossy(&self.body).into_owned(),
            headers,
        }
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body as a chunk stream: one chunk, then end.
    pub fn body_stream(&self) -> impl Stream<Item = Bytes> + Send + 'static {
        futures::stream::once(futures::future::ready(self.body.clone()))
    }

    /// Resolves once the originating connection has gone away.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Query parameter lookup on the request URL
    #[must_use]
    pub fn query_param(&self, key: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}
