use nanoid::nanoid;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Generate a 21-character nanoid (URL-safe alphabet, never contains `:`)
pub fn generate_id() -> String {
    nanoid!()
}

/// Reject identifiers that would make broker channel names ambiguous.
fn validate_id(kind: &str, raw: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(Error::InvalidInput(format!("{kind} must not be empty")));
    }
    if raw.len() > 128 {
        return Err(Error::InvalidInput(format!("{kind} is too long")));
    }
    if raw.chars().any(|c| c == ':' || c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidInput(format!(
            "{kind} contains invalid characters"
        )));
    }
    Ok(())
}

/// Session ID: binds a streaming client to its handler-side worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(generate_id())
    }

    /// Parse an id received from a client (query parameter, header).
    pub fn parse(raw: &str) -> Result<Self> {
        validate_id("sessionId", raw)?;
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request ID: correlates one unary request with its reply channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(generate_id())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        validate_id("requestId", raw)?;
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
