//! Frame types for the Beacon client protocol.
//!
//! Frames are exchanged between a client and the instance that holds its
//! connection. Each frame is serialized using MessagePack.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Command = 0x01,
    Push = 0x02,
    Ack = 0x03,
    Error = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    Connected = 0x07,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Command),
            0x02 => Ok(FrameType::Push),
            0x03 => Ok(FrameType::Ack),
            0x04 => Ok(FrameType::Error),
            0x05 => Ok(FrameType::Ping),
            0x06 => Ok(FrameType::Pong),
            0x07 => Ok(FrameType::Connected),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Client-to-server command addressed to a topic.
    #[serde(rename = "command")]
    Command {
        /// Optional request ID for acknowledgment.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Topic used to resolve the decoder and handlers.
        topic: String,
        /// Serialized message body.
        payload: String,
    },

    /// Server-to-client message pushed to a topic.
    #[serde(rename = "push")]
    Push {
        /// Topic the message was routed to.
        topic: String,
        /// Serialized message body.
        payload: String,
    },

    /// Acknowledgment of a command.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged command.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed command (0 if not applicable).
        id: u64,
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Connection registered and ready.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Instance that owns the connection.
        instance_id: String,
        /// Protocol major version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Command { .. } => FrameType::Command,
            Frame::Push { .. } => FrameType::Push,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
        }
    }

    /// Create a new Command frame.
    #[must_use]
    pub fn command(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Frame::Command {
            id: None,
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Create a new Command frame with ID for acknowledgment.
    #[must_use]
    pub fn command_with_ack(
        id: u64,
        topic: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Frame::Command {
            id: Some(id),
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Create a new Push frame.
    #[must_use]
    pub fn push(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Frame::Push {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        instance_id: impl Into<String>,
        version: u8,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            instance_id: instance_id.into(),
            version,
            heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        let command = Frame::command("gps", "{}");
        assert_eq!(command.frame_type(), FrameType::Command);

        let push = Frame::push("alert", "{}");
        assert_eq!(push.frame_type(), FrameType::Push);
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x01), Ok(FrameType::Command));
        assert_eq!(FrameType::try_from(0x07), Ok(FrameType::Connected));
        assert!(FrameType::try_from(0x08).is_err());
        assert_eq!(u8::from(FrameType::Push), 0x02);
    }
}
