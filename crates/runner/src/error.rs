use std::time::Duration;

use protocol::ProtocolError;
use transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("not connected to a test host")]
    NotConnected,

    #[error("no handshake answer within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("test host disconnected: {}", .0.as_deref().unwrap_or("connection closed"))]
    HostDisconnected(Option<String>),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
