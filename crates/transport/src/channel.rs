use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender};
use protocol::FrameCodec;

use crate::io::{CommunicationTransport, TransportWriter};
use crate::reader::{FrameReader, PollResult};
use crate::TransportError;

/// Notifications raised by a channel's read loop, in wire order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One complete frame arrived
    MessageReceived(String),
    /// The peer went away or the transport failed. This is always the last
    /// event of a channel. It is not raised when the channel was stopped
    /// locally.
    Disconnected { error: Option<String> },
}

struct ChannelInner {
    writer: Mutex<Box<dyn TransportWriter>>,
    codec: FrameCodec,
    peer: String,
    closed: Arc<AtomicBool>,

    // Option because of drop and take
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// One live connection to a peer.
///
/// Cloning a channel gives another handle to the same connection. Sending is
/// safe from any thread, although in normal operation only a job queue
/// worker sends. Incoming frames are delivered as [`ChannelEvent`]s on the
/// receiver returned by [`Channel::with_transport`].
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel over `transport` and start its read loop
    ///
    /// ```
    /// use transport::{Channel, ChannelEvent, InMemoryTransport};
    ///
    /// let (left, right) = InMemoryTransport::pair();
    /// let (sender, _) = Channel::with_transport(left)?;
    /// let (_receiver, events) = Channel::with_transport(right)?;
    ///
    /// sender.send(r#"{"MessageType":"SessionEnd"}"#)?;
    /// let event = events.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    /// assert!(matches!(event, ChannelEvent::MessageReceived(_)));
    /// # Ok::<(), transport::TransportError>(())
    /// ```
    pub fn with_transport<T>(transport: T) -> Result<(Self, Receiver<ChannelEvent>), TransportError>
    where
        T: CommunicationTransport,
    {
        Self::with_codec(transport, FrameCodec::new())
    }

    /// Like [`Channel::with_transport`] with a custom frame codec
    pub fn with_codec<T>(
        transport: T,
        codec: FrameCodec,
    ) -> Result<(Self, Receiver<ChannelEvent>), TransportError>
    where
        T: CommunicationTransport,
    {
        let peer = transport.peer();
        let (input, output) = transport.split()?;
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let closed = Arc::new(AtomicBool::new(false));

        let inner = Arc::new(ChannelInner {
            writer: Mutex::new(Box::new(output)),
            codec: codec.clone(),
            peer: peer.clone(),
            closed: Arc::clone(&closed),
            shutdown: Mutex::new(Some(shutdown_tx)),
        });

        // the read loop must not keep the channel alive, so it only shares the flag
        thread::Builder::new()
            .name("channel-reader".to_string())
            .spawn(move || {
                let reader = FrameReader::with_codec(input, codec);
                read_loop(reader, events_tx, shutdown_rx, &closed, &peer);
            })?;

        tracing::debug!(peer = %inner.peer, "channel created");
        Ok((Self { inner }, events_rx))
    }

    /// Write one frame carrying `text`
    ///
    /// # Errors
    ///
    /// [`TransportError::ChannelClosed`] once the channel has been stopped,
    /// [`TransportError::Write`] if the transport fails.
    #[tracing::instrument(skip(self, text), level = "trace", fields(length = text.len()))]
    pub fn send(&self, text: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }

        let mut frame = BytesMut::new();
        self.inner.codec.encode(text, &mut frame)?;

        let mut writer = lock(&self.inner.writer);
        // re-check under the lock so no frame is written after stop()
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        writer.write_all(&frame).map_err(TransportError::Write)?;
        writer.flush().map_err(TransportError::Write)?;
        Ok(())
    }

    /// Close the transport. Returns `true` for the call that actually closed it.
    pub fn stop(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        tracing::debug!(peer = %self.inner.peer, "stopping channel");
        if let Err(e) = lock(&self.inner.writer).close() {
            tracing::debug!(error = %e, "error closing transport");
        }
        self.inner.signal_shutdown();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelInner {
    fn signal_shutdown(&self) {
        if let Some(tx) = lock(&self.shutdown).take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        tracing::trace!(peer = %self.peer, "dropping channel");
        // Shutdown the background thread
        self.signal_shutdown();
    }
}

fn read_loop<R>(
    mut reader: FrameReader<R>,
    events: Sender<ChannelEvent>,
    shutdown: oneshot::Receiver<()>,
    closed: &AtomicBool,
    peer: &str,
) where
    R: std::io::Read,
{
    loop {
        // check for shutdown
        match shutdown.try_recv() {
            Ok(_) => return,
            Err(oneshot::TryRecvError::Empty) => {}
            Err(oneshot::TryRecvError::Disconnected) => return,
        }

        match reader.poll_frame() {
            Ok(PollResult::Frame(text)) => {
                if events.send(ChannelEvent::MessageReceived(text)).is_err() {
                    tracing::debug!(%peer, "no listener for channel events");
                    return;
                }
            }
            Ok(PollResult::Timeout) => {}
            Ok(PollResult::Closed) => {
                if !closed.load(Ordering::SeqCst) {
                    tracing::debug!(%peer, "peer closed the connection");
                    let _ = events.send(ChannelEvent::Disconnected { error: None });
                }
                return;
            }
            Err(TransportError::Frame(e)) if e.is_recoverable() => {
                tracing::warn!(%peer, error = %e, "dropping unreadable frame");
            }
            Err(e) => {
                if !closed.load(Ordering::SeqCst) {
                    tracing::warn!(%peer, error = %e, "channel read failed");
                    let _ = events.send(ChannelEvent::Disconnected {
                        error: Some(e.to_string()),
                    });
                }
                return;
            }
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::io::InMemoryTransport;

    fn channel_pair() -> (
        (Channel, Receiver<ChannelEvent>),
        (Channel, Receiver<ChannelEvent>),
    ) {
        let (left, right) = InMemoryTransport::pair();
        (
            Channel::with_transport(left).unwrap(),
            Channel::with_transport(right).unwrap(),
        )
    }

    #[test]
    fn frames_arrive_in_order() {
        let ((left, _), (_right, right_events)) = channel_pair();

        for i in 0..20 {
            left.send(&format!("frame {i}")).unwrap();
        }

        for i in 0..20 {
            let event = right_events.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(event, ChannelEvent::MessageReceived(format!("frame {i}")));
        }
    }

    #[test]
    fn stop_is_idempotent_and_rejects_sends() {
        let ((left, left_events), (_right, right_events)) = channel_pair();

        assert!(left.stop());
        assert!(!left.stop());
        assert!(left.is_closed());
        assert!(matches!(left.send("late"), Err(TransportError::ChannelClosed)));

        // peer observes the disconnect, the stopping side does not
        let event = right_events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, ChannelEvent::Disconnected { error: None });
        assert!(left_events.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn garbled_frame_does_not_end_the_channel() {
        let (left, right) = InMemoryTransport::pair();
        let (_left_reader, mut raw_writer) = left.split().unwrap();
        let (_right, events) = Channel::with_transport(right).unwrap();

        raw_writer.write_all(&[2, 0, 0, 0, 0xff, 0xfe]).unwrap();
        let mut good = BytesMut::new();
        FrameCodec::new().encode("after", &mut good).unwrap();
        raw_writer.write_all(&good).unwrap();

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, ChannelEvent::MessageReceived("after".to_string()));
    }

    #[test]
    fn oversized_frame_disconnects() {
        let (left, right) = InMemoryTransport::pair();
        let (_left_reader, mut raw_writer) = left.split().unwrap();
        let (_right, events) =
            Channel::with_codec(right, FrameCodec::with_max_size(16)).unwrap();

        raw_writer.write_all(&1024u32.to_le_bytes()).unwrap();

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, ChannelEvent::Disconnected { error: Some(_) }));
    }
}
