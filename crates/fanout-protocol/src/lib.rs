// fanout-protocol: the wire envelope carried over the WebSocket and the
// cluster bus.
//
// An envelope is a self-describing typed payload addressed to an optional
// recipient. `recipient == 0` is the broadcast sentinel (see `Envelope::is_broadcast`).
// Encoding is JSON; unknown fields are ignored on decode so the wire format
// stays forward-compatible with producers that add fields this crate doesn't
// know about yet.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The unit of application payload crossing the WebSocket and the cluster bus.
///
/// `recipient == 0` means broadcast (delivered to every session on a Hub);
/// any other value addresses a single recipient id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "user_id", default)]
    pub recipient: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "payload", default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),
    #[error("envelope kind must not be empty")]
    EmptyKind,
}

impl Envelope {
    /// Build a directed envelope addressed to a single recipient.
    ///
    /// `recipient` must be greater than zero (zero is the broadcast sentinel)
    /// and `kind` must be non-empty.
    pub fn directed(
        recipient: u64,
        kind: impl Into<String>,
        body: Option<serde_json::Value>,
    ) -> Result<Self, EnvelopeError> {
        let kind = kind.into();
        if kind.is_empty() {
            return Err(EnvelopeError::EmptyKind);
        }
        Ok(Self {
            recipient,
            kind,
            body,
        })
    }

    /// Build a broadcast envelope (`recipient == 0`), delivered to every
    /// session registered with the Hub it's published through.
    pub fn broadcast(
        kind: impl Into<String>,
        body: Option<serde_json::Value>,
    ) -> Result<Self, EnvelopeError> {
        Self::directed(0, kind, body)
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.recipient == 0
    }

    /// Encode to the wire format. Deterministic and round-trip safe for any
    /// body the JSON encoder supports.
    pub fn encode(&self) -> Bytes {
        // `Envelope` only ever holds JSON-serializable bodies constructed
        // through the factories above, so encoding cannot fail.
        Bytes::from(serde_json::to_vec(self).expect("envelope always serializes"))
    }

    /// Parse a wire-format envelope. Unknown fields are ignored; only
    /// syntactic/shape errors are reported.
    pub fn parse(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Return a copy of this envelope re-addressed to `recipient`.
    #[must_use]
    pub fn with_recipient(&self, recipient: u64) -> Self {
        Self {
            recipient,
            kind: self.kind.clone(),
            body: self.body.clone(),
        }
    }
}
