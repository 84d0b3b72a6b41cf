//! TCP-based transport implementation

use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::{CommunicationTransport, TransportWriter};

/// Read timeout applied to the reader half so the read loop can poll for shutdown
pub const TCP_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// TCP-based transport
///
/// # Timeout Behavior
///
/// The reader is configured with a short read timeout to enable periodic
/// checking of shutdown signals in the background read loop. When no data is
/// available, the reader returns `WouldBlock` errors.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Create a new TCP transport from an existing, connected stream
    ///
    /// # Errors
    ///
    /// Returns an error if configuring the socket fails
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_read_timeout(Some(TCP_READ_TIMEOUT))?;
        // frames are small and latency sensitive
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Connect to a listening peer
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::new(stream)
    }
}

impl CommunicationTransport for TcpTransport {
    type Reader = TcpStream;
    type Writer = TcpStream;

    fn peer(&self) -> String {
        self.stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown tcp peer>".to_string())
    }

    fn split(self) -> io::Result<(Self::Reader, Self::Writer)> {
        let input = self.stream.try_clone()?;
        Ok((input, self.stream))
    }
}

impl TransportWriter for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}
