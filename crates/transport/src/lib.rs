//! Runner/test host transport
//!
//! This crate moves protocol frames between two processes: a [`Channel`]
//! owns one connected transport, writes length-prefixed frames and runs a
//! background read loop that reassembles incoming frames. An endpoint
//! ([`SocketServer`] or [`SocketClient`]) establishes the connection and
//! hands out the channel.
pub mod bindings;
mod channel;
pub mod endpoint;
mod error;
pub mod io;
pub mod reader;

pub use channel::{Channel, ChannelEvent};
pub use endpoint::{
    CommunicationEndpoint, ConnectedEventArgs, Connection, ConnectionInfo, ConnectionRole,
    InMemoryEndpoint, SocketClient, SocketServer, TransportKind,
};
pub use error::TransportError;
pub use io::{CommunicationTransport, InMemoryTransport, TcpTransport, TransportWriter};
pub use reader::{FrameReader, PollResult};

/// Address used when the caller does not pick one: loopback, any free port
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:0";
