//! Transport over a pair of byte channels, for tests that need no sockets

use std::io::{self, Cursor, Read, Write};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{CommunicationTransport, TransportWriter};

const IN_MEMORY_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// One end of an in-process byte pipe.
///
/// Bytes written to one end of a [`InMemoryTransport::pair`] are read from
/// the other, chunk by chunk, in write order.
///
/// # Examples
///
/// ```
/// use std::io::{Read, Write};
/// use transport::io::{CommunicationTransport, InMemoryTransport};
///
/// let (runner, host) = InMemoryTransport::pair();
/// let (_runner_reader, mut runner_writer) = runner.split()?;
/// let (mut host_reader, _host_writer) = host.split()?;
///
/// runner_writer.write_all(b"ping")?;
/// let mut buf = [0u8; 4];
/// host_reader.read_exact(&mut buf)?;
/// assert_eq!(&buf, b"ping");
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct InMemoryTransport {
    reader: InMemoryReader,
    writer: InMemoryWriter,
}

/// Receiving end of an [`InMemoryTransport`]
///
/// Reads from a channel while keeping the partially consumed chunk around.
/// When nothing arrives within a short timeout it returns `WouldBlock`,
/// mirroring the read timeout of the TCP transport.
pub struct InMemoryReader {
    buffer: Cursor<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// Sending end of an [`InMemoryTransport`]
///
/// Closing drops the sending side, which the peer reads as end-of-stream.
pub struct InMemoryWriter {
    tx: Option<Sender<Vec<u8>>>,
}

impl InMemoryTransport {
    /// Two transports wired to each other, like the two sides of an
    /// accepted socket
    pub fn pair() -> (Self, Self) {
        let (left_tx, right_rx) = crossbeam_channel::unbounded();
        let (right_tx, left_rx) = crossbeam_channel::unbounded();

        let left = Self {
            reader: InMemoryReader {
                buffer: Cursor::new(Vec::new()),
                rx: left_rx,
            },
            writer: InMemoryWriter { tx: Some(left_tx) },
        };

        let right = Self {
            reader: InMemoryReader {
                buffer: Cursor::new(Vec::new()),
                rx: right_rx,
            },
            writer: InMemoryWriter { tx: Some(right_tx) },
        };

        (left, right)
    }
}

impl CommunicationTransport for InMemoryTransport {
    type Reader = InMemoryReader;
    type Writer = InMemoryWriter;

    fn peer(&self) -> String {
        "in-memory".to_string()
    }

    fn split(self) -> io::Result<(Self::Reader, Self::Writer)> {
        Ok((self.reader, self.writer))
    }
}

impl Read for InMemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffer.position() >= self.buffer.get_ref().len() as u64 {
            match self.rx.recv_timeout(IN_MEMORY_READ_TIMEOUT) {
                Ok(data) => self.buffer = Cursor::new(data),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "nothing written by peer yet",
                    ));
                }
                // peer closed: end of stream
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }

        self.buffer.read(buf)
    }
}

impl Write for InMemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"))?;
        tx.send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer transport dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TransportWriter for InMemoryWriter {
    fn close(&mut self) -> io::Result<()> {
        self.tx.take();
        Ok(())
    }
}
