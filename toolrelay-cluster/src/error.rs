//! Error types for the relay cluster

use http::StatusCode;
use std::time::Duration;
use thiserror::Error;
use toolrelay_core::{RequestId, SessionId};

/// Broker operation failures
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Channel already has a local subscription: {0}")]
    AlreadySubscribed(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Timed out during broker {0}")]
    Timeout(&'static str),
}

/// Relay and session failures, each mapped to a caller-visible status
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Missing sessionId query parameter")]
    MissingSession,

    #[error("Invalid sessionId: {0}")]
    InvalidSession(String),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Request {request_id} timed out after {}ms", .after.as_millis())]
    Timeout { request_id: RequestId, after: Duration },

    #[error("Malformed response envelope: {0}")]
    MalformedResponse(String),

    #[error("Reply channel closed before a response arrived")]
    ReplyChannelClosed,

    #[error("Failed to serialize request envelope: {0}")]
    Serialization(#[from] toolrelay_core::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl RelayError {
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingSession | Self::InvalidSession(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Self::MalformedResponse(_)
            | Self::ReplyChannelClosed
            | Self::Serialization(_)
            | Self::Broker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics and logs
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::MissingSession => "missing_session",
            Self::InvalidSession(_) => "invalid_session",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Timeout { .. } => "timeout",
            Self::MalformedResponse(_) => "malformed_response",
            Self::ReplyChannelClosed => "reply_closed",
            Self::Serialization(_) => "serialization",
            Self::Broker(_) => "broker_error",
        }
    }
}
