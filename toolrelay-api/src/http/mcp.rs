//! Protocol endpoints
//!
//! `GET /mcp` and `GET /mcp/sse` hold the event stream of a session,
//! `POST /mcp/message?sessionId=` relays a request to whichever instance
//! holds that stream, and `POST /mcp` invokes the handler directly without a
//! session.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use toolrelay_cluster::{
    response_channel, CompletionError, RelayResponse, SessionContext, StreamSession,
    TransportKind, TransportRequest,
};
use tracing::{debug, warn};

use super::{AppError, AppResult, AppState};

const EVENT_STREAM: &str = "text/event-stream";

/// `GET /mcp`: only event-stream clients are served here.
pub async fn stream_with_accept(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Response> {
    if !accepts_event_stream(&headers) {
        return Err(AppError::not_acceptable(format!(
            "GET /mcp requires Accept: {EVENT_STREAM}"
        )));
    }
    open_stream(state).await
}

/// `GET /mcp/sse`
pub async fn stream(State(state): State<AppState>) -> AppResult<Response> {
    open_stream(state).await
}

async fn open_stream(state: AppState) -> AppResult<Response> {
    let (session, frames) = StreamSession::open(
        &state.registry,
        Arc::clone(&state.broker),
        Arc::clone(&state.handler),
        state.stream_config,
        state.shutdown.clone(),
    )
    .await?;
    debug!(session_id = %session.session_id(), "Event stream opened");

    let events = ReceiverStream::new(frames)
        .map(|frame| Ok::<_, Infallible>(Event::default().data(frame)));
    Ok(Sse::new(events).into_response())
}

/// `POST /mcp/message?sessionId=...`
pub async fn message(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let request = TransportRequest::new(method, uri, headers, body);
    let session_id = request.query_param("sessionId");
    let relayed = state.relay.forward(session_id.as_deref(), &request).await?;
    Ok(relayed_response(relayed))
}

/// `POST /mcp`: serve the handler straight onto this response.
pub async fn direct(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let request = TransportRequest::new(method, uri, headers, body);
    let (writer, handle) = response_channel(TransportKind::Streamed);
    let live = handle
        .into_live()
        .ok_or_else(|| AppError::internal("Streamed response unavailable"))?;

    let handler = Arc::clone(&state.handler);
    tokio::spawn(async move {
        if let Err(e) = handler
            .handle(SessionContext::stateless(), request, writer)
            .await
        {
            warn!(error = %e, "Direct request handler failed");
        }
    });

    let (status, headers, chunks) =
        live.into_parts(state.request_timeout)
            .await
            .map_err(|e| match e {
                CompletionError::Dropped => {
                    AppError::internal("Handler finished without a response")
                }
                CompletionError::TimedOut => {
                    AppError::request_timeout("Handler did not respond in time")
                }
            })?;

    let mut response = Response::new(Body::from_stream(chunks.map(Ok::<_, Infallible>)));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains(EVENT_STREAM))
}

/// The handler's `{status, body}` as an HTTP response
fn relayed_response(relayed: RelayResponse) -> Response {
    let content_type = if serde_json::from_str::<serde::de::IgnoredAny>(&relayed.body).is_ok() {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    if relayed.body.is_empty() {
        return relayed.status.into_response();
    }
    (
        relayed.status,
        [(header::CONTENT_TYPE, content_type)],
        relayed.body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_accepts_event_stream() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_event_stream(&headers));

        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        assert!(accepts_event_stream(&headers));
    }

    #[test]
    fn test_relayed_response_content_type() {
        let json = relayed_response(RelayResponse {
            status: StatusCode::OK,
            body: r#"{"result":"hi"}"#.to_string(),
        });
        assert_eq!(json.headers()[header::CONTENT_TYPE], "application/json");

        let text = relayed_response(RelayResponse {
            status: StatusCode::OK,
            body: "plain".to_string(),
        });
        assert_eq!(
            text.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );

        let empty = relayed_response(RelayResponse {
            status: StatusCode::ACCEPTED,
            body: String::new(),
        });
        assert_eq!(empty.status(), StatusCode::ACCEPTED);
    }
}
