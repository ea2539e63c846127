//! Relay envelopes.
//!
//! An envelope asks a specific remote instance to deliver an already
//! serialized payload to a connection it owns. Envelopes are transient: they
//! live for one delivery attempt and carry no retry state.

use serde::{Deserialize, Serialize};

use crate::version::PROTOCOL_VERSION;

/// A cross-instance relay request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Target connection, owned by the receiving instance.
    pub connection_id: String,
    /// Topic the payload was routed to.
    pub topic: String,
    /// Serialized message body.
    pub payload: String,
    /// Instance that produced the envelope.
    pub origin_instance_id: String,
    /// Protocol major version of the producing instance.
    pub version: u8,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(
        connection_id: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<String>,
        origin_instance_id: impl Into<String>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            topic: topic.into(),
            payload: payload.into(),
            origin_instance_id: origin_instance_id.into(),
            version: PROTOCOL_VERSION.major,
        }
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_creation() {
        let envelope = Envelope::new("c2", "alert", "hello", "A");
        assert_eq!(envelope.connection_id, "c2");
        assert_eq!(envelope.topic, "alert");
        assert_eq!(envelope.payload_size(), 5);
        assert_eq!(envelope.origin_instance_id, "A");
        assert_eq!(envelope.version, PROTOCOL_VERSION.major);
    }
}
