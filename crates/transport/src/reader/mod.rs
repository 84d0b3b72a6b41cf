//! Incremental frame reader

use std::io::{self, Read};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use protocol::FrameCodec;

use crate::TransportError;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Result of one poll of a [`FrameReader`]
#[derive(Debug, PartialEq, Eq)]
pub enum PollResult {
    /// A complete frame was received
    Frame(String),
    /// The peer closed the connection
    Closed,
    /// No complete frame is available yet
    Timeout,
}

/// Reassembles length-prefixed frames from a byte stream.
///
/// Bytes that arrive ahead of a complete frame stay in an internal buffer
/// across polls, so a read timeout in the middle of a frame never loses data.
pub struct FrameReader<R> {
    input: R,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl<R> FrameReader<R>
where
    R: Read,
{
    pub fn new(input: R) -> Self {
        Self::with_codec(input, FrameCodec::new())
    }

    pub fn with_codec(input: R, codec: FrameCodec) -> Self {
        Self {
            input,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            codec,
        }
    }

    /// Read until a frame is complete, the peer closes, or the underlying
    /// reader reports that no data is currently available.
    pub fn poll_frame(&mut self) -> Result<PollResult, TransportError> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(text) = self.codec.decode(&mut self.buffer)? {
                tracing::trace!(length = text.len(), "received frame");
                return Ok(PollResult::Frame(text));
            }

            match self.input.read(&mut chunk) {
                Ok(0) => {
                    if !self.buffer.is_empty() {
                        tracing::warn!(
                            pending = self.buffer.len(),
                            "connection closed in the middle of a frame"
                        );
                    }
                    return Ok(PollResult::Closed);
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(PollResult::Timeout);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    /// Poll until a frame arrives, the connection closes or `timeout` expires
    pub fn try_read_frame(&mut self, timeout: Duration) -> Result<PollResult, TransportError> {
        let start = Instant::now();
        loop {
            match self.poll_frame()? {
                PollResult::Timeout => {
                    if start.elapsed() >= timeout {
                        return Ok(PollResult::Timeout);
                    }
                    // Brief sleep to prevent CPU spinning
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => return Ok(other),
            }
        }
    }

    /// Block until a frame arrives; `None` once the peer has closed
    pub fn read_frame(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.poll_frame()? {
                PollResult::Frame(text) => return Ok(Some(text)),
                PollResult::Closed => return Ok(None),
                PollResult::Timeout => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }
}
