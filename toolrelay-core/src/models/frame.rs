//! Control frames sent to streaming clients and session lifecycle notices

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::id::SessionId;

/// Frames generated by the streaming endpoint itself (application events
/// are relayed verbatim and never wrapped).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ControlFrame {
    Connection { status: String, session_id: SessionId },
    Ping { timestamp: i64 },
}

impl ControlFrame {
    #[must_use]
    pub fn established(session_id: SessionId) -> Self {
        Self::Connection {
            status: "established".to_string(),
            session_id,
        }
    }

    #[must_use]
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Why a streaming connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientAbort,
    MaxDuration,
    ServerError,
    Shutdown,
}

impl CloseReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientAbort => "client_abort",
            Self::MaxDuration => "max_duration",
            Self::ServerError => "server_error",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on `session:{sessionId}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SessionNotice {
    Disconnected {
        session_id: SessionId,
        reason: CloseReason,
        timestamp: i64,
    },
}

impl SessionNotice {
    #[must_use]
    pub fn disconnected(session_id: SessionId, reason: CloseReason) -> Self {
        Self::Disconnected {
            session_id,
            reason,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_frame_shape() {
        let frame = ControlFrame::established(SessionId::parse("abc").unwrap());
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "connection", "status": "established", "sessionId": "abc"})
        );
    }

    #[test]
    fn test_ping_frame_shape() {
        let value = serde_json::to_value(ControlFrame::ping()).unwrap();
        assert_eq!(value["type"], "ping");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_disconnect_notice_shape() {
        let notice =
            SessionNotice::disconnected(SessionId::parse("abc").unwrap(), CloseReason::MaxDuration);
        let value = serde_json::to_value(&notice).unwrap();
        assert_eq!(value["type"], "disconnected");
        assert_eq!(value["sessionId"], "abc");
        assert_eq!(value["reason"], "max_duration");
    }
}
