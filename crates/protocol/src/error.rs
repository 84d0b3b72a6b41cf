//! Error types for the protocol layer.

/// Errors produced while shaping, encoding or decoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame text is not a valid message envelope.
    #[error("malformed message: {0}")]
    MalformedMessage(#[source] serde_json::Error),

    /// The payload of a message could not be converted to the requested type.
    #[error("payload of {message_type} does not match the expected type: {source}")]
    PayloadTypeMismatch {
        /// Type tag of the offending message.
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// Failed to serialize an outgoing payload.
    #[error("serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The frame body was not valid UTF-8.
    #[error("frame body is not valid UTF-8")]
    InvalidUtf8,

    /// The declared frame length exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum allowed {max}")]
    FrameTooLarge {
        /// The declared size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },
}

impl ProtocolError {
    /// Whether the byte stream can still be read after this error.
    ///
    /// An oversized length prefix leaves the reader unable to find the next
    /// frame boundary; every other error only affects the frame it came from.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ProtocolError::FrameTooLarge { .. })
    }
}
