//! Establishing a connection between runner and test host
//!
//! Either process may listen. The side that listens uses [`SocketServer`],
//! the side that dials uses [`SocketClient`]; both report the outcome through
//! a [`ConnectedEventArgs`] on the receiver returned by their constructor.

use std::fmt;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use protocol::FrameCodec;
use retry::{OperationResult, delay::Exponential, retry};

use crate::io::{InMemoryTransport, TcpTransport};
use crate::{Channel, ChannelEvent, TransportError};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Which side of the connection this process takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Listen and accept the peer's connection
    Host,
    /// Dial a listening peer
    Client,
}

impl FromStr for ConnectionRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "client" => Ok(Self::Client),
            other => Err(format!("invalid connection role {other}")),
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Host => f.write_str("host"),
            ConnectionRole::Client => f.write_str("client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Sockets,
}

/// Where and how to connect; fixed for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub endpoint: String,
    pub role: ConnectionRole,
    pub transport: TransportKind,
}

impl ConnectionInfo {
    pub fn new(endpoint: impl Into<String>, role: ConnectionRole) -> Self {
        Self {
            endpoint: endpoint.into(),
            role,
            transport: TransportKind::Sockets,
        }
    }
}

/// A connected channel together with the events of its read loop
pub struct Connection {
    pub channel: Channel,
    pub events: Receiver<ChannelEvent>,
}

/// Outcome of an endpoint's attempt to connect.
///
/// The notification is raised for failures too; check `connected` before
/// using `connection`.
pub struct ConnectedEventArgs {
    pub connected: bool,
    pub connection: Option<Connection>,
    pub fault: Option<String>,
}

impl ConnectedEventArgs {
    pub fn success(connection: Connection) -> Self {
        Self {
            connected: true,
            connection: Some(connection),
            fault: None,
        }
    }

    pub fn failure(fault: impl Into<String>) -> Self {
        Self {
            connected: false,
            connection: None,
            fault: Some(fault.into()),
        }
    }
}

impl fmt::Debug for ConnectedEventArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedEventArgs")
            .field("connected", &self.connected)
            .field("fault", &self.fault)
            .finish()
    }
}

/// One end of the runner/test host connection
pub trait CommunicationEndpoint: Send {
    /// Begin listening or dialing without blocking.
    ///
    /// Returns the effective address: for a listener bound to port 0 this is
    /// the port actually chosen, which the caller hands to its peer.
    fn start(&mut self, address: &str) -> Result<String, TransportError>;

    /// Stop listening and close the connection if one was made
    fn stop(&mut self);
}

/// Create the endpoint matching `role`
pub fn for_role(
    role: ConnectionRole,
    codec: FrameCodec,
) -> (Box<dyn CommunicationEndpoint>, Receiver<ConnectedEventArgs>) {
    match role {
        ConnectionRole::Host => {
            let (server, connected) = SocketServer::with_codec(codec);
            (Box::new(server), connected)
        }
        ConnectionRole::Client => {
            let (client, connected) = SocketClient::with_codec(codec);
            (Box::new(client), connected)
        }
    }
}

#[derive(Default)]
struct EndpointShared {
    stopped: AtomicBool,
    channel: Mutex<Option<Channel>>,
}

impl EndpointShared {
    fn publish(
        &self,
        stream: TcpStream,
        codec: FrameCodec,
        connected: &Sender<ConnectedEventArgs>,
    ) -> Result<(), TransportError> {
        let transport = TcpTransport::new(stream)?;
        let (channel, events) = Channel::with_codec(transport, codec)?;
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = Some(channel.clone());

        // stop() may have raced with the connection being made
        if self.stopped.load(Ordering::SeqCst) {
            channel.stop();
            return Ok(());
        }

        let _ = connected.send(ConnectedEventArgs::success(Connection { channel, events }));
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(channel) = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            channel.stop();
        }
    }
}

/// Listening endpoint: accepts the first incoming connection
pub struct SocketServer {
    shared: Arc<EndpointShared>,
    codec: FrameCodec,
    connected: Sender<ConnectedEventArgs>,
    acceptor: Option<JoinHandle<()>>,
}

impl SocketServer {
    pub fn new() -> (Self, Receiver<ConnectedEventArgs>) {
        Self::with_codec(FrameCodec::new())
    }

    pub fn with_codec(codec: FrameCodec) -> (Self, Receiver<ConnectedEventArgs>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let server = Self {
            shared: Arc::default(),
            codec,
            connected: tx,
            acceptor: None,
        };
        (server, rx)
    }
}

impl CommunicationEndpoint for SocketServer {
    #[tracing::instrument(skip(self))]
    fn start(&mut self, address: &str) -> Result<String, TransportError> {
        let connect_error = |e: io::Error| TransportError::Connect {
            address: address.to_string(),
            reason: e.to_string(),
        };

        let listener = TcpListener::bind(address).map_err(connect_error)?;
        listener.set_nonblocking(true).map_err(connect_error)?;
        let local = listener.local_addr().map_err(connect_error)?.to_string();
        tracing::info!(address = %local, "listening for connection");

        let shared = Arc::clone(&self.shared);
        let codec = self.codec.clone();
        let connected = self.connected.clone();
        let acceptor = thread::Builder::new()
            .name("endpoint-acceptor".to_string())
            .spawn(move || accept_first(listener, &shared, codec, &connected))
            .map_err(connect_error)?;
        self.acceptor = Some(acceptor);

        Ok(local)
    }

    fn stop(&mut self) {
        tracing::debug!("stopping server endpoint");
        self.shared.stop();
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }
}

fn accept_first(
    listener: TcpListener,
    shared: &EndpointShared,
    codec: FrameCodec,
    connected: &Sender<ConnectedEventArgs>,
) {
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            tracing::debug!("listener stopped before a connection was made");
            return;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::info!(%peer, "accepted connection");
                let published = stream
                    .set_nonblocking(false)
                    .map_err(TransportError::from)
                    .and_then(|_| shared.publish(stream, codec, connected));
                if let Err(e) = published {
                    tracing::error!(error = %e, "could not set up accepted connection");
                    let _ = connected.send(ConnectedEventArgs::failure(e.to_string()));
                }
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                tracing::error!(error = %e, "accepting connection failed");
                let _ = connected.send(ConnectedEventArgs::failure(e.to_string()));
                return;
            }
        }
    }
}

/// Dialing endpoint: connects to a listening peer, retrying while it starts up
pub struct SocketClient {
    shared: Arc<EndpointShared>,
    codec: FrameCodec,
    connected: Sender<ConnectedEventArgs>,
    retries: usize,
    dialer: Option<JoinHandle<()>>,
}

impl SocketClient {
    pub fn new() -> (Self, Receiver<ConnectedEventArgs>) {
        Self::with_codec(FrameCodec::new())
    }

    pub fn with_codec(codec: FrameCodec) -> (Self, Receiver<ConnectedEventArgs>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let client = Self {
            shared: Arc::default(),
            codec,
            connected: tx,
            retries: 10,
            dialer: None,
        };
        (client, rx)
    }

    /// Number of additional connection attempts after the first one fails
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }
}

/// Exponential backoff starting at 50ms, capped at one second per attempt
fn retry_scale(retries: usize) -> impl Iterator<Item = Duration> {
    Exponential::from_millis(50)
        .map(|delay| delay.min(Duration::from_secs(1)))
        .take(retries)
}

impl CommunicationEndpoint for SocketClient {
    #[tracing::instrument(skip(self))]
    fn start(&mut self, address: &str) -> Result<String, TransportError> {
        let shared = Arc::clone(&self.shared);
        let codec = self.codec.clone();
        let connected = self.connected.clone();
        let retries = self.retries;
        let target = address.to_string();

        let dialer = thread::Builder::new()
            .name("endpoint-dialer".to_string())
            .spawn(move || {
                let attempt = retry(retry_scale(retries), || {
                    if shared.stopped.load(Ordering::SeqCst) {
                        return OperationResult::Err(io::Error::new(
                            io::ErrorKind::Interrupted,
                            "endpoint stopped",
                        ));
                    }
                    tracing::debug!(address = %target, "trying to make connection");
                    match TcpStream::connect(&target) {
                        Ok(stream) => OperationResult::Ok(stream),
                        Err(e) => {
                            tracing::debug!(error = %e, "error making connection");
                            OperationResult::Retry(e)
                        }
                    }
                });

                match attempt {
                    Ok(stream) => {
                        tracing::info!(address = %target, "connected");
                        if let Err(e) = shared.publish(stream, codec, &connected) {
                            let _ = connected.send(ConnectedEventArgs::failure(e.to_string()));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(address = %target, error = %e, "could not connect");
                        let _ = connected.send(ConnectedEventArgs::failure(e.to_string()));
                    }
                }
            })
            .map_err(|e| TransportError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        self.dialer = Some(dialer);

        Ok(address.to_string())
    }

    fn stop(&mut self) {
        tracing::debug!("stopping client endpoint");
        self.shared.stop();
        // the dialer notices the stop flag at its next attempt; no need to wait for it
        self.dialer.take();
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }
}

/// Endpoint over an [`InMemoryTransport`], connected as soon as it starts
pub struct InMemoryEndpoint {
    transport: Option<InMemoryTransport>,
    channel: Option<Channel>,
    connected: Sender<ConnectedEventArgs>,
}

impl InMemoryEndpoint {
    pub fn new(transport: InMemoryTransport) -> (Self, Receiver<ConnectedEventArgs>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let endpoint = Self {
            transport: Some(transport),
            channel: None,
            connected: tx,
        };
        (endpoint, rx)
    }
}

impl CommunicationEndpoint for InMemoryEndpoint {
    fn start(&mut self, _address: &str) -> Result<String, TransportError> {
        let transport = self.transport.take().ok_or_else(|| TransportError::Connect {
            address: "in-memory".to_string(),
            reason: "endpoint already started".to_string(),
        })?;
        let (channel, events) = Channel::with_transport(transport)?;
        self.channel = Some(channel.clone());
        let _ = self
            .connected
            .send(ConnectedEventArgs::success(Connection { channel, events }));
        Ok("in-memory".to_string())
    }

    fn stop(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.stop();
        }
    }
}
