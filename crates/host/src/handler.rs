use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use eyre::WrapErr;
use job_queue::{JobQueue, QueueOptions};
use protocol::payloads::{
    AttachDebuggerAckPayload, AttachmentSet, DiscoveryCompleteEventArgs, DiscoveryCriteria,
    HandshakeAck, TestCase, TestMessageLevel, TestProcessStartInfo, TestRunChangedEventArgs,
    TestRunCompleteEventArgs, TestRunCriteriaWithSources, TestRunCriteriaWithTests,
};
use protocol::{Message, MessageType, ProtocolError};
use serde::de::DeserializeOwned;
use transport::{ChannelEvent, CommunicationEndpoint, ConnectedEventArgs, ConnectionInfo};

use crate::events::{DiscoveryEventsAdapter, RunEventsAdapter, SessionLogger};
use crate::managers::{
    Diagnostics, DiscoveryManager, ExecutionManager, ManagerFactory, TestRunRequest,
};
use crate::session::{Session, lock};
use crate::{DebuggerError, SessionState, Termination};

/// Limits and timeouts of a [`RequestHandler`]
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub highest_supported_version: u32,
    pub max_queue_length: usize,
    pub max_queue_size: usize,
    /// How long session end waits for queued work
    pub flush_timeout: Duration,
    pub debugger_attach_timeout: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self::from(&config::Settings::default())
    }
}

impl From<&config::Settings> for HandlerOptions {
    fn from(settings: &config::Settings) -> Self {
        Self {
            highest_supported_version: settings.highest_supported_version,
            max_queue_length: settings.job_queue.max_length,
            max_queue_size: settings.job_queue.max_size,
            flush_timeout: settings.flush_timeout(),
            debugger_attach_timeout: settings.debugger_attach_timeout(),
        }
    }
}

type Operation = Box<dyn FnOnce() -> eyre::Result<()> + Send>;

#[derive(Clone)]
struct Managers {
    discovery: Arc<dyn DiscoveryManager>,
    execution: Arc<dyn ExecutionManager>,
}

enum Flow {
    Continue,
    Stop,
}

/// The test host end of a runner session.
///
/// Typical use:
///
/// 1. [`RequestHandler::initialize_communication`] starts listening or dialing
/// 2. [`RequestHandler::wait_for_request_sender_connection`] waits for the runner
/// 3. [`RequestHandler::process_requests`] answers requests until the session ends
/// 4. [`RequestHandler::close`]
///
/// All methods take `&self`; share the handler behind an `Arc` to cancel it
/// from another thread.
pub struct RequestHandler {
    session: Arc<Session>,
    endpoint: Mutex<Box<dyn CommunicationEndpoint>>,
    address: String,
    connected: Receiver<ConnectedEventArgs>,
    events: Mutex<Option<Receiver<ChannelEvent>>>,

    // collaborator calls run here so the dispatch loop keeps receiving
    operations: JobQueue<Operation>,
    // cleared when queued operations must no longer reach a manager
    operations_open: Arc<AtomicBool>,
    managers: Mutex<Option<Managers>>,

    // dropped to cancel
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,

    diagnostics: Option<Arc<dyn Diagnostics>>,
    channel_stopped: AtomicBool,
    closed: AtomicBool,
}

impl RequestHandler {
    /// Create a handler using a socket endpoint for `connection`
    pub fn new(connection: &ConnectionInfo, options: HandlerOptions) -> eyre::Result<Self> {
        let (endpoint, connected) =
            transport::endpoint::for_role(connection.role, protocol::FrameCodec::new());
        Self::with_endpoint(endpoint, connected, &connection.endpoint, options)
    }

    /// Create a handler on a pre-built endpoint
    pub fn with_endpoint(
        endpoint: Box<dyn CommunicationEndpoint>,
        connected: Receiver<ConnectedEventArgs>,
        address: &str,
        options: HandlerOptions,
    ) -> eyre::Result<Self> {
        let operations = JobQueue::new(
            QueueOptions::named("operations").unbounded(),
            |operation: Operation| operation(),
        )?;
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(1);

        Ok(Self {
            session: Arc::new(Session::new(options)?),
            endpoint: Mutex::new(endpoint),
            address: address.to_string(),
            connected,
            events: Mutex::new(None),
            operations,
            operations_open: Arc::new(AtomicBool::new(true)),
            managers: Mutex::new(None),
            cancel_tx: Mutex::new(Some(cancel_tx)),
            cancel_rx,
            diagnostics: None,
            channel_stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Enable `diagnostics` when the runner performs the handshake
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// `None` while the session is still running
    pub fn termination(&self) -> Option<Termination> {
        self.session.state().termination()
    }

    /// Negotiated protocol version, or the base version before the handshake
    pub fn protocol_version(&self) -> u32 {
        self.session.version()
    }

    /// Start the endpoint without waiting for a connection.
    ///
    /// Returns the effective address, which for a listener is where the
    /// runner has to connect.
    #[tracing::instrument(skip(self), fields(address = %self.address))]
    pub fn initialize_communication(&self) -> eyre::Result<String> {
        let address = lock(&self.endpoint)
            .start(&self.address)
            .wrap_err("starting communication endpoint")?;
        self.session.advance(SessionState::CommunicationInitialized);
        tracing::info!(%address, "communication initialized");
        Ok(address)
    }

    /// Wait until the runner is connected.
    ///
    /// Returns false if no connection was made within `timeout`, the
    /// connection attempt failed, or the handler was canceled.
    #[tracing::instrument(skip(self))]
    pub fn wait_for_request_sender_connection(&self, timeout: Duration) -> bool {
        let args = crossbeam_channel::select! {
            recv(self.connected) -> args => match args {
                Ok(args) => args,
                Err(_) => {
                    tracing::error!("endpoint stopped before a connection was made");
                    return false;
                }
            },
            recv(self.cancel_rx) -> _ => {
                tracing::info!("canceled while waiting for connection");
                return false;
            },
            default(timeout) => {
                tracing::error!(?timeout, "timed out waiting for the runner to connect");
                return false;
            },
        };

        let connection = match args {
            ConnectedEventArgs {
                connected: true,
                connection: Some(connection),
                ..
            } => connection,
            ConnectedEventArgs { fault, .. } => {
                tracing::error!(?fault, "connection to the runner failed");
                return false;
            }
        };

        tracing::info!(peer = %connection.channel.peer(), "runner connected");
        self.session.attach_channel(connection.channel);
        *lock(&self.events) = Some(connection.events);
        self.session.advance(SessionState::AwaitingHandshake);
        true
    }

    /// Answer requests until the session ends.
    ///
    /// Returns on `SessionEnd`, when the connection fails, or when the
    /// handler is canceled; [`RequestHandler::termination`] tells which.
    #[tracing::instrument(skip_all)]
    pub fn process_requests(&self, factory: &dyn ManagerFactory) {
        let Some(events) = lock(&self.events).take() else {
            tracing::error!("no runner connection to process requests from");
            return;
        };
        let managers = Managers {
            discovery: factory.discovery_manager(),
            execution: factory.execution_manager(),
        };
        *lock(&self.managers) = Some(managers.clone());

        tracing::debug!("processing requests");
        loop {
            crossbeam_channel::select! {
                recv(events) -> event => match event {
                    Ok(ChannelEvent::MessageReceived(raw)) => {
                        if let Flow::Stop = self.dispatch(&raw, &managers) {
                            break;
                        }
                    }
                    Ok(ChannelEvent::Disconnected { error }) => {
                        self.abort_session(error.as_deref().unwrap_or("runner disconnected"));
                        break;
                    }
                    Err(_) => {
                        self.abort_session("connection events ended");
                        break;
                    }
                },
                recv(self.cancel_rx) -> _ => {
                    tracing::info!("request processing canceled");
                    break;
                },
            }
        }
    }

    fn dispatch(&self, raw: &str, managers: &Managers) -> Flow {
        let message = match protocol::deserialize_message(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed message");
                return Flow::Continue;
            }
        };

        let message_type = message.message_type.clone();
        let state = self.session.state();
        tracing::debug!(%message_type, %state, "received message");

        if state.is_terminal() {
            return Flow::Stop;
        }
        if state == SessionState::AwaitingHandshake
            && !matches!(message_type, MessageType::VersionCheck | MessageType::SessionEnd)
        {
            tracing::warn!(%message_type, "dropping message received before the handshake");
            return Flow::Continue;
        }

        match message_type {
            MessageType::VersionCheck => self.handle_version_check(&message),
            MessageType::DiscoveryInitialize => {
                if let Some(paths) = payload::<Vec<String>>(&message) {
                    let manager = Arc::clone(&managers.discovery);
                    let logger = SessionLogger(Arc::clone(&self.session));
                    self.run_operation("discovery initialize", move || {
                        if let Err(e) = guarded(|| manager.initialize(paths, &logger)) {
                            report_failure(&logger.0, "initializing discovery", &e);
                        }
                    });
                }
            }
            MessageType::StartDiscovery => {
                if let Some(criteria) = payload::<DiscoveryCriteria>(&message) {
                    self.start_discovery(criteria, managers);
                }
            }
            MessageType::ExecutionInitialize => {
                if let Some(paths) = payload::<Vec<String>>(&message) {
                    let manager = Arc::clone(&managers.execution);
                    let logger = SessionLogger(Arc::clone(&self.session));
                    self.run_operation("execution initialize", move || {
                        if let Err(e) = guarded(|| manager.initialize(paths, &logger)) {
                            report_failure(&logger.0, "initializing execution", &e);
                        }
                    });
                }
            }
            MessageType::StartTestExecutionWithSources => {
                if let Some(criteria) = payload::<TestRunCriteriaWithSources>(&message) {
                    self.start_test_run(criteria.into(), managers);
                }
            }
            MessageType::StartTestExecutionWithTests => {
                if let Some(criteria) = payload::<TestRunCriteriaWithTests>(&message) {
                    self.start_test_run(criteria.into(), managers);
                }
            }
            MessageType::CancelTestRun => {
                tracing::info!("canceling test run");
                let adapter = RunEventsAdapter::new(Arc::clone(&self.session));
                managers.execution.cancel(&adapter);
            }
            MessageType::AbortTestRun => {
                tracing::info!("aborting test run");
                let adapter = RunEventsAdapter::new(Arc::clone(&self.session));
                managers.execution.abort(&adapter);
            }
            MessageType::LaunchAdapterProcessWithDebuggerAttachedCallback => {
                if let Some(process_id) = payload::<i32>(&message) {
                    self.session.complete_launch(process_id);
                }
            }
            MessageType::AttachDebuggerCallback => {
                if let Some(ack) = attach_ack(&message) {
                    self.session.complete_attach(ack);
                }
            }
            MessageType::SessionEnd => {
                self.end_session(managers);
                return Flow::Stop;
            }
            MessageType::SessionAbort => {
                // the runner may still exchange messages after an abort
                tracing::info!("session abort requested, keeping the connection open");
            }
            other => {
                tracing::warn!(message_type = %other, "ignoring unexpected message type");
            }
        }

        Flow::Continue
    }

    fn handle_version_check(&self, message: &Message) {
        if self.session.state() != SessionState::AwaitingHandshake {
            tracing::warn!("ignoring repeated version check");
            return;
        }
        // a handshake is always answered, an unreadable version counts as the base one
        let theirs = payload::<u32>(message).unwrap_or(protocol::BASE_PROTOCOL_VERSION);

        let negotiated = theirs
            .min(self.session.options.highest_supported_version)
            .max(protocol::BASE_PROTOCOL_VERSION);
        tracing::info!(theirs, negotiated, "protocol version negotiated");

        let ack = match self.diagnostics.as_ref().map(|diagnostics| diagnostics.enable()) {
            Some(Err(e)) => {
                tracing::warn!(error = %e, "could not enable diagnostics");
                HandshakeAck::WithDiagnosticsError {
                    version: negotiated,
                    diagnostics_error: format!("{e:#}"),
                }
            }
            _ => HandshakeAck::Version(negotiated),
        };

        // the acknowledgement itself is sent before the version takes effect
        match protocol::serialize_payload(MessageType::VersionCheck, &ack) {
            Ok(text) => {
                let _ = self.session.enqueue(MessageType::VersionCheck, text);
            }
            Err(e) => tracing::error!(error = %e, "could not serialize handshake"),
        }
        self.session.set_version(negotiated);
        self.session.advance(SessionState::Ready);
    }

    fn start_discovery(&self, criteria: DiscoveryCriteria, managers: &Managers) {
        tracing::info!(sources = ?criteria.sources, "starting discovery");
        self.session.advance(SessionState::Discovering);

        let session = Arc::clone(&self.session);
        let manager = Arc::clone(&managers.discovery);
        self.run_operation("discovery", move || {
            let adapter = DiscoveryEventsAdapter::new(Arc::clone(&session));
            if let Err(e) = guarded(|| manager.discover_tests(criteria, &adapter)) {
                report_failure(&session, "discovering tests", &e);
                if !adapter.completed() {
                    session.discovery_complete(
                        DiscoveryCompleteEventArgs {
                            total_count: -1,
                            is_aborted: true,
                            metrics: None,
                        },
                        Vec::new(),
                    );
                }
            }
        });
    }

    fn start_test_run(&self, request: TestRunRequest, managers: &Managers) {
        tracing::info!(run_target = ?request.target, "starting test run");
        self.session.advance(SessionState::Executing);

        let session = Arc::clone(&self.session);
        let manager = Arc::clone(&managers.execution);
        self.run_operation("test run", move || {
            let adapter = RunEventsAdapter::new(Arc::clone(&session));
            if let Err(e) = guarded(|| manager.start_test_run(request, &adapter)) {
                report_failure(&session, "running tests", &e);
                if !adapter.completed() {
                    let args = TestRunCompleteEventArgs {
                        is_aborted: true,
                        error: Some(format!("{e:#}")),
                        ..Default::default()
                    };
                    session.send_execution_complete(args, None, Vec::new(), Vec::new());
                }
            }
        });
    }

    fn run_operation<F>(&self, name: &'static str, operation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let open = Arc::clone(&self.operations_open);
        let session = Arc::clone(&self.session);
        let operation: Operation = Box::new(move || {
            if !open.load(Ordering::SeqCst) || session.state().is_terminal() {
                tracing::debug!(operation = name, "session is over, skipping operation");
                return Ok(());
            }
            tracing::debug!(operation = name, "operation started");
            operation();
            tracing::debug!(operation = name, "operation finished");
            Ok(())
        });
        if let Err(e) = self.operations.enqueue(operation, 1) {
            tracing::warn!(operation = name, error = %e, "operation not started");
        }
    }

    fn end_session(&self, managers: &Managers) {
        tracing::info!("session end requested");
        let flush_timeout = self.session.options.flush_timeout;

        if let Err(e) = self.operations.flush_with_timeout(flush_timeout) {
            tracing::warn!(error = %e, "operations still running at session end");
            self.operations_open.store(false, Ordering::SeqCst);
            self.session.debugger.cancel();
            managers
                .execution
                .abort(&RunEventsAdapter::new(Arc::clone(&self.session)));
        }
        if let Err(e) = self.session.outgoing().flush_with_timeout(flush_timeout) {
            tracing::warn!(error = %e, "outgoing messages not sent at session end");
        }

        self.session.advance(SessionState::Ended);
        self.stop_channel();
        tracing::info!("session ended");
    }

    fn abort_session(&self, reason: &str) {
        if self.session.advance(SessionState::Aborted) {
            tracing::error!(%reason, "session ended abnormally");
        }
        self.session.debugger.cancel();
        self.stop_channel();
    }

    fn stop_channel(&self) {
        if self.channel_stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(channel) = self.session.channel() {
            channel.stop();
        }
    }

    /// Queue a `TestMessage` for the runner
    pub fn send_log(&self, level: TestMessageLevel, message: &str) {
        self.session.send_log(level, message);
    }

    pub fn send_discovered_tests(&self, tests: &[TestCase]) {
        self.session.send_discovered_tests(tests);
    }

    pub fn discovery_complete(&self, args: DiscoveryCompleteEventArgs, last_chunk: Vec<TestCase>) {
        self.session.discovery_complete(args, last_chunk);
    }

    pub fn send_test_run_statistics(&self, args: &TestRunChangedEventArgs) {
        self.session.send_test_run_statistics(args);
    }

    pub fn send_execution_complete(
        &self,
        args: TestRunCompleteEventArgs,
        last_chunk: Option<TestRunChangedEventArgs>,
        run_attachments: Vec<AttachmentSet>,
        executor_uris: Vec<String>,
    ) {
        self.session
            .send_execution_complete(args, last_chunk, run_attachments, executor_uris);
    }

    /// Ask the runner to start a process under a debugger and wait for its id
    pub fn launch_process_with_debugger_attached(
        &self,
        start_info: TestProcessStartInfo,
    ) -> Result<i32, DebuggerError> {
        self.session.launch_process_with_debugger_attached(start_info)
    }

    /// Ask the runner to attach a debugger to `process_id` and wait for the answer
    pub fn attach_debugger_to_process(&self, process_id: i32) -> Result<bool, DebuggerError> {
        self.session.attach_debugger_to_process(process_id)
    }

    /// Stop processing: unblocks [`RequestHandler::process_requests`], the
    /// connection wait and any pending debugger request, aborts a test run
    /// in progress, then closes.
    pub fn cancel(&self) {
        let Some(cancel_tx) = lock(&self.cancel_tx).take() else {
            self.close();
            return;
        };
        tracing::info!("canceling request handler");
        let running = self.session.state() == SessionState::Executing;
        self.session.advance(SessionState::Canceled);
        self.operations_open.store(false, Ordering::SeqCst);
        self.session.debugger.cancel();
        drop(cancel_tx);

        // close() waits for the operation in progress, so the run has to be told to stop
        if running && let Some(managers) = lock(&self.managers).clone() {
            tracing::info!("aborting test run in progress");
            managers
                .execution
                .abort(&RunEventsAdapter::new(Arc::clone(&self.session)));
        }
        self.close();
    }

    /// Stop the connection, endpoint and queues. Safe to call repeatedly and
    /// from any thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("closing request handler");
        self.session.debugger.cancel();
        self.stop_channel();
        lock(&self.endpoint).stop();
        self.operations.dispose();
        self.session.outgoing().dispose();
    }
}

impl Drop for RequestHandler {
    fn drop(&mut self) {
        self.close();
    }
}

fn payload<T>(message: &Message) -> Option<T>
where
    T: DeserializeOwned,
{
    match message.payload_as::<T>() {
        Ok(payload) => Some(payload),
        Err(ProtocolError::PayloadTypeMismatch { message_type, source }) => {
            tracing::warn!(%message_type, error = %source, "dropping message with unexpected payload");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "dropping unreadable message");
            None
        }
    }
}

// older runners answer with a bare boolean
fn attach_ack(message: &Message) -> Option<AttachDebuggerAckPayload> {
    if let Some(attached) = message.payload.as_bool() {
        return Some(AttachDebuggerAckPayload {
            attached,
            error_message: None,
        });
    }
    payload(message)
}

fn guarded<F>(call: F) -> eyre::Result<()>
where
    F: FnOnce() -> eyre::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(eyre::eyre!("manager panicked: {reason}"))
        }
    }
}

fn report_failure(session: &Session, activity: &str, error: &eyre::Report) {
    tracing::error!(error = %format!("{error:#}"), "{activity} failed");
    session.send_log(TestMessageLevel::Error, &format!("{activity} failed: {error:#}"));
}
