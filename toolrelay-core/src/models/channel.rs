//! Broker channel names
//!
//! These names are part of the wire contract shared with every other
//! instance talking to the same broker and must not change.

use super::id::{RequestId, SessionId};

/// Channel the session worker listens on for request envelopes
#[must_use]
pub fn requests(session_id: &SessionId) -> String {
    format!("requests:{session_id}")
}

/// Reply channel for one relayed request
#[must_use]
pub fn responses(session_id: &SessionId, request_id: &RequestId) -> String {
    format!("responses:{session_id}:{request_id}")
}

/// Channel whose payloads are pushed verbatim to the streaming client
#[must_use]
pub fn events(session_id: &SessionId) -> String {
    format!("events:{session_id}")
}

/// Lifecycle notices (disconnection) for a session
#[must_use]
pub fn session(session_id: &SessionId) -> String {
    format!("session:{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        let sid = SessionId::parse("abc").unwrap();
        let rid = RequestId::parse("r1").unwrap();
        assert_eq!(requests(&sid), "requests:abc");
        assert_eq!(responses(&sid, &rid), "responses:abc:r1");
        assert_eq!(events(&sid), "events:abc");
        assert_eq!(session(&sid), "session:abc");
    }
}
