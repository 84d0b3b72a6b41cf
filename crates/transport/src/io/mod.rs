//! IO abstraction layer for the protocol transport
//!
//! The core trait [`CommunicationTransport`] allows plugging in different IO
//! implementations, such as TCP sockets or in-memory channels for tests.
//!
//! # Examples
//!
//! ```no_run
//! use transport::{Channel, io::TcpTransport};
//!
//! let transport = TcpTransport::connect("127.0.0.1:12345")?;
//! let (channel, events) = Channel::with_transport(transport)?;
//! # Ok::<(), transport::TransportError>(())
//! ```
//!
//! ```
//! use transport::{Channel, io::InMemoryTransport};
//!
//! let (runner, host) = InMemoryTransport::pair();
//! let (channel, events) = Channel::with_transport(runner)?;
//! # Ok::<(), transport::TransportError>(())
//! ```

use std::io::{self, Read, Write};

mod memory;
mod tcp;

pub use memory::{InMemoryReader, InMemoryTransport, InMemoryWriter};
pub use tcp::TcpTransport;

/// Write half of a transport.
///
/// Besides writing bytes, the write half knows how to close the connection
/// so that the peer observes end-of-stream.
pub trait TransportWriter: Write + Send + 'static {
    /// Close the connection. Calling this more than once is harmless.
    fn close(&mut self) -> io::Result<()>;
}

/// Trait for bidirectional frame transport
///
/// Implementations must provide a way to split the transport into separate
/// reader and writer halves that can be moved into different threads.
///
/// # Requirements
///
/// - Both halves must be `Send + 'static` to work with background threads
/// - The reader should return `WouldBlock` (or `TimedOut`) when no data
///   arrives within a short period, so that the read loop can notice a
///   shutdown request
pub trait CommunicationTransport: Send + 'static {
    /// The reader half
    type Reader: Read + Send + 'static;

    /// The writer half
    type Writer: TransportWriter;

    /// Human readable description of the remote side, used in logs
    fn peer(&self) -> String;

    /// Split the transport into separate reader and writer halves
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be split (e.g., socket cloning fails)
    fn split(self) -> io::Result<(Self::Reader, Self::Writer)>;
}
