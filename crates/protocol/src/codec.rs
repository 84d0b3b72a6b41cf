//! Length-prefixed frame codec.

use bytes::{Buf, BufMut, BytesMut};

use crate::{ProtocolError, Result};

/// Size of the little-endian length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum frame body size (64 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Codec for protocol frames.
///
/// ```text
/// +----------------+---------------------------+
/// | u32 LE length  | UTF-8 JSON, `length` bytes |
/// +----------------+---------------------------+
/// ```
///
/// Decoding is incremental: bytes are appended to a buffer as they arrive and
/// [`FrameCodec::decode`] yields a frame only once it is complete.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Frames larger than this are rejected with [`ProtocolError::FrameTooLarge`].
    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Try to take one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when more data is needed. A frame whose body is not
    /// UTF-8 is consumed before the error is returned, so the next call starts
    /// at the following frame.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let body_length = u32::from_le_bytes(prefix) as usize;

        if body_length > self.max_frame_size {
            tracing::warn!(size = body_length, max = self.max_frame_size, "rejecting oversized frame");
            return Err(ProtocolError::FrameTooLarge {
                size: body_length,
                max: self.max_frame_size,
            });
        }

        let total_length = LENGTH_PREFIX_SIZE + body_length;
        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let body = src.split_to(body_length);
        match String::from_utf8(body.to_vec()) {
            Ok(text) => Ok(Some(text)),
            Err(e) => {
                tracing::debug!(length = body_length, error = %e, "skipping frame that is not UTF-8");
                Err(ProtocolError::InvalidUtf8)
            }
        }
    }

    /// Append one frame carrying `text` to `dst`
    pub fn encode(&self, text: &str, dst: &mut BytesMut) -> Result<()> {
        if text.len() > self.max_frame_size || text.len() > u32::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + text.len());
        dst.put_u32_le(text.len() as u32);
        dst.put_slice(text.as_bytes());
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
