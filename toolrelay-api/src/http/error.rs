// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use toolrelay_cluster::{BrokerError, RelayError};

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_acceptable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_ACCEPTABLE, message)
    }

    pub fn request_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::REQUEST_TIMEOUT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Convert relay errors to HTTP errors
impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        let status = err.status_code();
        match err {
            RelayError::Broker(e) => {
                tracing::error!("Broker error: {}", e);
                let message = match e {
                    BrokerError::Timeout(_) => "Broker timed out",
                    _ => "Broker unavailable",
                };
                AppError::new(status, message)
            }
            RelayError::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                AppError::new(status, "Data processing error")
            }
            RelayError::MalformedResponse(_) | RelayError::ReplyChannelClosed => {
                tracing::error!("Relay error: {}", err);
                AppError::new(status, err.to_string())
            }
            other => AppError::new(status, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use toolrelay_core::RequestId;

    #[test]
    fn test_relay_error_statuses() {
        assert_eq!(
            AppError::from(RelayError::MissingSession).status,
            StatusCode::BAD_REQUEST
        );
        let timeout = AppError::from(RelayError::Timeout {
            request_id: RequestId::new(),
            after: Duration::from_secs(10),
        });
        assert_eq!(timeout.status, StatusCode::REQUEST_TIMEOUT);
        assert!(timeout.message.contains("timed out after 10000ms"));

        let broker = AppError::from(RelayError::Broker(BrokerError::Connection(
            "redis://secret@host".to_string(),
        )));
        assert_eq!(broker.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!broker.message.contains("secret"));
    }

    #[test]
    fn test_malformed_response_keeps_diagnostic() {
        let err = AppError::from(RelayError::MalformedResponse("expected value".to_string()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.message.contains("expected value"));
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = AppError::not_acceptable("Accept must include text/event-stream").into_response();
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], 406);
        assert_eq!(body["error"], "Accept must include text/event-stream");

        assert_eq!(
            AppError::request_timeout("late").status,
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            AppError::internal("boom").status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
