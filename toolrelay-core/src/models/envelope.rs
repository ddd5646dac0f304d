//! Envelopes exchanged over the broker
//!
//! A request envelope is published on `requests:{sessionId}` and answered by
//! exactly one response envelope on `responses:{sessionId}:{requestId}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::id::RequestId;
use crate::error::Result;

/// Serialized inbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub body: String,
    /// Lower-cased header names. A header sent more than once keeps every
    /// value, in order.
    #[serde(default)]
    pub headers: BTreeMap<String, HeaderField>,
}

/// One header's value(s) on the wire
///
/// Values are carried as Latin-1 text: each byte maps to the char with the
/// same code point, so opaque (`obs-text`) bytes survive the JSON hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderField {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderField {
    /// Encode raw header bytes as Latin-1 text.
    #[must_use]
    pub fn encode_value(bytes: &[u8]) -> String {
        bytes.iter().copied().map(char::from).collect()
    }

    /// Recover raw bytes from an encoded value. Text with code points above
    /// `U+00FF` was not produced by [`Self::encode_value`] and is taken as
    /// UTF-8 instead.
    #[must_use]
    pub fn decode_value(value: &str) -> Vec<u8> {
        value
            .chars()
            .map(|c| u8::try_from(u32::from(c)).ok())
            .collect::<Option<Vec<u8>>>()
            .unwrap_or_else(|| value.as_bytes().to_vec())
    }

    /// Add another value, promoting to `Multi` on the second one.
    pub fn push(&mut self, value: String) {
        match self {
            Self::Single(first) => {
                let first = std::mem::take(first);
                *self = Self::Multi(vec![first, value]);
            }
            Self::Multi(values) => values.push(value),
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            Self::Single(value) => std::slice::from_ref(value),
            Self::Multi(values) => values,
        };
        values.iter().map(String::as_str)
    }
}

impl From<&str> for HeaderField {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

impl RequestEnvelope {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Best-effort extraction of `requestId` from a payload that failed to
    /// parse as a full envelope.
    #[must_use]
    pub fn salvage_request_id(payload: &str) -> Option<RequestId> {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        let raw = value.get("requestId")?.as_str()?;
        RequestId::parse(raw).ok()
    }
}

/// Serialized handler output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    #[serde(default)]
    pub body: String,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Error envelope with a JSON `{"error": message}` body
    #[must_use]
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let body = serde_json::json!({ "error": message.into() }).to_string();
        Self { status, body }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope_wire_shape() {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), HeaderField::from("application/json"));
        let mut accept = HeaderField::from("application/json");
        accept.push("text/event-stream".to_string());
        headers.insert("accept".to_string(), accept);
        let envelope = RequestEnvelope {
            request_id: RequestId::parse("r1").unwrap(),
            url: "/mcp/message?sessionId=abc".to_string(),
            method: "POST".to_string(),
            body: "{}".to_string(),
            headers,
        };

        let value: serde_json::Value =
            serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["url"], "/mcp/message?sessionId=abc");
        assert_eq!(value["method"], "POST");
        assert_eq!(value["body"], "{}");
        assert_eq!(value["headers"]["content-type"], "application/json");
        assert_eq!(
            value["headers"]["accept"],
            serde_json::json!(["application/json", "text/event-stream"])
        );

        let parsed = RequestEnvelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_header_value_latin1_encoding() {
        let raw = b"caf\xe9";
        let encoded = HeaderField::encode_value(raw);
        assert_eq!(encoded, "caf\u{e9}");
        assert_eq!(HeaderField::decode_value(&encoded), raw.to_vec());

        // Text that cannot be Latin-1 falls back to its UTF-8 bytes.
        assert_eq!(HeaderField::decode_value("\u{2713}"), "\u{2713}".as_bytes().to_vec());
    }

    #[test]
    fn test_response_envelope_parses_reference_payload() {
        let parsed =
            ResponseEnvelope::from_json(r#"{"status":200,"body":"{\"result\":\"hi\"}"}"#).unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.body, r#"{"result":"hi"}"#);
    }

    #[test]
    fn test_error_envelope_body() {
        let envelope = ResponseEnvelope::error(500, "boom");
        let body: serde_json::Value = serde_json::from_str(&envelope.body).unwrap();
        assert_eq!(envelope.status, 500);
        assert_eq!(body["error"], "boom");
    }

    #[test]
    fn test_salvage_request_id() {
        assert_eq!(
            RequestEnvelope::salvage_request_id(r#"{"requestId":"r9","method":42}"#)
                .map(|id| id.to_string()),
            Some("r9".to_string())
        );
        assert!(RequestEnvelope::salvage_request_id("not json").is_none());
        assert!(RequestEnvelope::salvage_request_id(r#"{"url":"/"}"#).is_none());
    }
}
