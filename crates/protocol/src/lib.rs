//! Runner/test host protocol.
//!
//! Every exchange between a runner and a test host is a [`Message`]: a
//! message type tag, an opaque JSON payload and an optional protocol version.
//! On the wire each message is one frame, a 4-byte little-endian length
//! followed by that many bytes of UTF-8 JSON (see [`FrameCodec`]).
//!
//! # Scope
//!
//! This crate only knows how to shape and encode messages. Moving frames
//! across a socket lives in `transport`, and deciding what to do with a
//! message lives in `host` and `runner`.

mod codec;
mod error;
mod message;
pub mod payloads;

pub use codec::{DEFAULT_MAX_FRAME_SIZE, FrameCodec, LENGTH_PREFIX_SIZE};
pub use error::ProtocolError;
pub use message::{
    Message, MessageType, deserialize_message, deserialize_payload, serialize_message,
    serialize_payload, serialize_versioned_payload,
};

/// Highest protocol version this implementation understands
pub const HIGHEST_SUPPORTED_VERSION: u32 = 6;

/// Version assumed before a handshake has taken place
pub const BASE_PROTOCOL_VERSION: u32 = 1;

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
