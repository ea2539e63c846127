//! # beacon-protocol
//!
//! Wire protocol definitions for Beacon.
//!
//! Two kinds of messages cross a process boundary:
//!
//! - **Frames** - exchanged between a client and the instance holding its
//!   connection (`command`, `push`, `connected`, keepalives)
//! - **Envelopes** - relay requests asking another instance to deliver a
//!   payload to a connection it owns
//!
//! Both use the same length-prefixed MessagePack encoding.
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, Envelope, Frame};
//!
//! let frame = Frame::push("alert", r#"{"level":"high"}"#);
//! let encoded = codec::encode(&frame).unwrap();
//! assert_eq!(codec::decode(&encoded).unwrap(), frame);
//!
//! let envelope = Envelope::new("conn-1", "alert", "{}", "instance-a");
//! let encoded = codec::encode_envelope(&envelope).unwrap();
//! assert_eq!(codec::decode_envelope(&encoded).unwrap(), envelope);
//! ```

pub mod codec;
pub mod envelope;
pub mod frames;
pub mod version;

pub use codec::{decode, decode_envelope, encode, encode_envelope, ProtocolError};
pub use envelope::Envelope;
pub use frames::{Frame, FrameType};
pub use version::{Version, PROTOCOL_VERSION};
