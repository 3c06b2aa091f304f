//! Type-safe identifiers for channels and connections.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Channel Code
// ============================================================================

/// Short code naming a broadcast channel (e.g. "WXYZ").
///
/// Generated codes are four uppercase letters, but clients may join any
/// code they learned out-of-band, so no format is enforced here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelCode(String);

impl ChannelCode {
    /// Creates a new ChannelCode from a string.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty code, which never names a channel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ChannelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChannelCode {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChannelCode {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ChannelCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Connection Id
// ============================================================================

/// Opaque per-connection token.
///
/// Assigned from a monotonic counter by the server when a transport
/// connection is accepted. Never reused within one process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
