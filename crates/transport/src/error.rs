use std::io;

use protocol::ProtocolError;

/// Errors raised by channels and endpoints.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Reading from the underlying transport failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Writing a frame to the underlying transport failed.
    #[error("failed to write frame: {0}")]
    Write(#[source] io::Error),

    /// The channel has been stopped.
    #[error("channel closed")]
    ChannelClosed,

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Frame(#[from] ProtocolError),

    /// The endpoint could not be started or could not reach its peer.
    #[error("failed to connect to {address}: {reason}")]
    Connect {
        /// The address being listened on or dialed.
        address: String,
        /// Description of the failure.
        reason: String,
    },
}
