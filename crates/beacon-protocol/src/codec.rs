//! Codec for encoding and decoding Beacon frames and envelopes.
//!
//! This module provides MessagePack-based serialization with length-prefixed framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::frames::Frame;
use crate::version::PROTOCOL_VERSION;

/// Maximum encoded message size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),

    /// Envelope produced by an instance on another major version.
    #[error("Incompatible envelope version {0}, expected {}", PROTOCOL_VERSION.major)]
    IncompatibleVersion(u8),
}

fn encode_value<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

fn decode_value<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Encode a frame to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_value(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    encode_value(frame, buf)
}

/// Decode a frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    decode_value(data)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;

    Ok(Some(frame))
}

/// Encode a relay envelope to bytes, using the same framing as client frames.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_value(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode a relay envelope from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid, or if
/// the envelope comes from another major protocol version.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, ProtocolError> {
    let envelope: Envelope = decode_value(data)?;
    if !PROTOCOL_VERSION.accepts_major(envelope.version) {
        return Err(ProtocolError::IncompatibleVersion(envelope.version));
    }
    if envelope.connection_id.is_empty() {
        return Err(ProtocolError::Invalid(
            "envelope without connection id".to_string(),
        ));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = vec![
            Frame::command("gps", r#"{"lat":1.0}"#),
            Frame::push("alert", "{}"),
            Frame::ack(42),
            Frame::error(1, 1001, "Invalid frame"),
            Frame::ping(),
            Frame::connected("conn-123", "instance-a", 1, 30000),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::command("gps", "{}");
        let encoded = encode(&frame).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let large_payload = "a".repeat(MAX_FRAME_SIZE + 1);
        let frame = Frame::push("alert", large_payload);

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::command("gps", "1");
        let frame2 = Frame::command("gps", "2");

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();

        let decoded1 = decode_from(&mut buf).unwrap().unwrap();
        let decoded2 = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(frame1, decoded1);
        assert_eq!(frame2, decoded2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope::new("c2", "alert", r#"{"text":"hi"}"#, "A");
        let encoded = encode_envelope(&envelope).unwrap();
        let decoded = decode_envelope(&encoded).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.origin_instance_id, "A");
    }

    #[test]
    fn test_envelope_rejects_missing_connection() {
        let envelope = Envelope::new("", "alert", "{}", "A");
        let encoded = encode_envelope(&envelope).unwrap();
        assert!(matches!(
            decode_envelope(&encoded),
            Err(ProtocolError::Invalid(_))
        ));
    }

    #[test]
    fn test_envelope_from_other_major_rejected() {
        let mut envelope = Envelope::new("c2", "alert", "{}", "A");
        envelope.version = PROTOCOL_VERSION.major + 1;
        let encoded = encode_envelope(&envelope).unwrap();

        match decode_envelope(&encoded) {
            Err(ProtocolError::IncompatibleVersion(v)) => assert_eq!(v, envelope.version),
            other => panic!("Expected IncompatibleVersion error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_is_not_an_envelope() {
        let encoded = encode(&Frame::ping()).unwrap();
        assert!(decode_envelope(&encoded).is_err());
    }
}
