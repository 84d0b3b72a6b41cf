use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use eyre::WrapErr;
use protocol::payloads::{
    AttachDebuggerAckPayload, DiscoveryCompletePayload, DiscoveryCriteria, HandshakeAck,
    TestCase, TestMessagePayload, TestProcessAttachDebuggerPayload, TestProcessStartInfo,
    TestRunChangedEventArgs, TestRunCompleteEventArgs, TestRunCompletePayload,
    TestRunCriteriaWithSources, TestRunCriteriaWithTests,
};
use protocol::{BASE_PROTOCOL_VERSION, HIGHEST_SUPPORTED_VERSION, Message, MessageType};
use serde::Serialize;
use serde::de::DeserializeOwned;
use transport::{Channel, ChannelEvent, CommunicationEndpoint, ConnectedEventArgs, ConnectionRole};

use crate::RunnerError;
use crate::handlers::{DebuggerLauncher, DiscoveryEventsHandler, RunEventsHandler};

#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub highest_supported_version: u32,
    pub handshake_timeout: Duration,
    /// How long `end_session` waits for the host to close the connection
    pub session_end_timeout: Duration,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            highest_supported_version: HIGHEST_SUPPORTED_VERSION,
            handshake_timeout: Duration::from_secs(90),
            session_end_timeout: Duration::from_secs(10),
        }
    }
}

/// What a test run should execute
#[derive(Debug, Clone)]
pub enum TestRunCriteria {
    Sources(TestRunCriteriaWithSources),
    Tests(TestRunCriteriaWithTests),
}

impl From<TestRunCriteriaWithSources> for TestRunCriteria {
    fn from(criteria: TestRunCriteriaWithSources) -> Self {
        TestRunCriteria::Sources(criteria)
    }
}

impl From<TestRunCriteriaWithTests> for TestRunCriteria {
    fn from(criteria: TestRunCriteriaWithTests) -> Self {
        TestRunCriteria::Tests(criteria)
    }
}

/// The runner end of a test host session.
///
/// Requests are sent with `&self`, so a run started on one thread can be
/// canceled from another through [`RequestSender::send_test_run_cancel`].
pub struct RequestSender {
    options: SenderOptions,
    endpoint: Mutex<Box<dyn CommunicationEndpoint>>,
    connected: Receiver<ConnectedEventArgs>,
    channel: Mutex<Option<Channel>>,
    events: Mutex<Option<Receiver<ChannelEvent>>>,
    version: AtomicU32,
    closed: AtomicBool,
}

impl RequestSender {
    /// Create a sender using a socket endpoint for `role`
    pub fn new(role: ConnectionRole, options: SenderOptions) -> Self {
        let (endpoint, connected) = transport::endpoint::for_role(role, protocol::FrameCodec::new());
        Self::with_endpoint(endpoint, connected, options)
    }

    pub fn with_endpoint(
        endpoint: Box<dyn CommunicationEndpoint>,
        connected: Receiver<ConnectedEventArgs>,
        options: SenderOptions,
    ) -> Self {
        Self {
            options,
            endpoint: Mutex::new(endpoint),
            connected,
            channel: Mutex::new(None),
            events: Mutex::new(None),
            version: AtomicU32::new(BASE_PROTOCOL_VERSION),
            closed: AtomicBool::new(false),
        }
    }

    /// Start listening on (or dialing) `address`, returning the effective address
    #[tracing::instrument(skip(self))]
    pub fn initialize_communication(&self, address: &str) -> eyre::Result<String> {
        let address = lock(&self.endpoint)
            .start(address)
            .wrap_err("starting communication endpoint")?;
        tracing::info!(%address, "waiting for test host");
        Ok(address)
    }

    /// Wait until the test host is connected; false on timeout or failure
    #[tracing::instrument(skip(self))]
    pub fn wait_for_request_handler_connection(&self, timeout: Duration) -> bool {
        match self.connected.recv_timeout(timeout) {
            Ok(ConnectedEventArgs {
                connected: true,
                connection: Some(connection),
                ..
            }) => {
                tracing::info!(peer = %connection.channel.peer(), "test host connected");
                *lock(&self.channel) = Some(connection.channel);
                *lock(&self.events) = Some(connection.events);
                true
            }
            Ok(ConnectedEventArgs { fault, .. }) => {
                tracing::error!(?fault, "could not connect to test host");
                false
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!(?timeout, "timed out waiting for test host");
                false
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::error!("endpoint stopped before the test host connected");
                false
            }
        }
    }

    pub fn protocol_version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    /// Perform the version handshake, returning the host's acknowledgement
    #[tracing::instrument(skip(self))]
    pub fn check_version(&self) -> Result<HandshakeAck, RunnerError> {
        let events = self.events()?;
        let text = protocol::serialize_payload(
            MessageType::VersionCheck,
            &self.options.highest_supported_version,
        )?;
        self.channel()?.send(&text)?;

        let timeout = self.options.handshake_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(message) = next_message(&events, remaining)? else {
                return Err(RunnerError::HandshakeTimeout(timeout));
            };
            match message.message_type {
                MessageType::VersionCheck => {
                    let ack = message.payload_as::<HandshakeAck>()?;
                    let version = ack
                        .version()
                        .min(self.options.highest_supported_version)
                        .max(BASE_PROTOCOL_VERSION);
                    if let HandshakeAck::WithDiagnosticsError {
                        diagnostics_error, ..
                    } = &ack
                    {
                        tracing::warn!(error = %diagnostics_error, "test host could not enable diagnostics");
                    }
                    tracing::info!(version, "protocol version negotiated");
                    self.version.store(version, Ordering::SeqCst);
                    return Ok(ack);
                }
                other => {
                    tracing::warn!(message_type = %other, "ignoring message before handshake");
                }
            }
        }
    }

    pub fn initialize_discovery(&self, extension_paths: &[String]) -> Result<(), RunnerError> {
        self.send(MessageType::DiscoveryInitialize, extension_paths)
    }

    /// Discover tests, streaming results to `handler` until discovery completes
    #[tracing::instrument(skip(self, handler), fields(sources = ?criteria.sources))]
    pub fn discover_tests(
        &self,
        criteria: &DiscoveryCriteria,
        handler: &mut dyn DiscoveryEventsHandler,
    ) -> Result<(), RunnerError> {
        let events = self.events()?;
        self.send(MessageType::StartDiscovery, criteria)?;

        loop {
            let message = match wait_for_message(&events) {
                Ok(message) => message,
                Err(RunnerError::HostDisconnected(reason)) => {
                    tracing::error!(?reason, "test host went away during discovery");
                    handler.handle_discovery_complete(DiscoveryCompletePayload {
                        total_tests: -1,
                        is_aborted: true,
                        ..Default::default()
                    });
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match message.message_type {
                MessageType::DiscoveredTests => {
                    if let Some(tests) = payload::<Vec<TestCase>>(&message) {
                        handler.handle_discovered_tests(tests);
                    }
                }
                MessageType::DiscoveryComplete => {
                    if let Some(complete) = payload::<DiscoveryCompletePayload>(&message) {
                        tracing::info!(total = complete.total_tests, "discovery complete");
                        handler.handle_discovery_complete(complete);
                        return Ok(());
                    }
                }
                MessageType::TestMessage => {
                    if let Some(log) = payload::<TestMessagePayload>(&message) {
                        handler.handle_log_message(log.message_level, &log.message);
                    }
                }
                other => tracing::debug!(message_type = %other, "ignoring message during discovery"),
            }
        }
    }

    pub fn initialize_execution(&self, extension_paths: &[String]) -> Result<(), RunnerError> {
        self.send(MessageType::ExecutionInitialize, extension_paths)
    }

    /// Run tests, streaming progress to `handler` until the run completes.
    ///
    /// Debugger requests from the host are answered through `launcher`.
    #[tracing::instrument(skip_all)]
    pub fn start_test_run(
        &self,
        criteria: TestRunCriteria,
        handler: &mut dyn RunEventsHandler,
        launcher: &mut dyn DebuggerLauncher,
    ) -> Result<(), RunnerError> {
        let events = self.events()?;
        match &criteria {
            TestRunCriteria::Sources(criteria) => {
                self.send(MessageType::StartTestExecutionWithSources, criteria)?
            }
            TestRunCriteria::Tests(criteria) => {
                self.send(MessageType::StartTestExecutionWithTests, criteria)?
            }
        }

        loop {
            let message = match wait_for_message(&events) {
                Ok(message) => message,
                Err(RunnerError::HostDisconnected(reason)) => {
                    tracing::error!(?reason, "test host went away during the test run");
                    handler.handle_test_run_complete(TestRunCompletePayload {
                        test_run_complete_args: TestRunCompleteEventArgs {
                            is_aborted: true,
                            error: Some(
                                reason.unwrap_or_else(|| "test host disconnected".to_string()),
                            ),
                            ..Default::default()
                        },
                        ..Default::default()
                    });
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match message.message_type {
                MessageType::TestRunStatsChange => {
                    if let Some(args) = payload::<TestRunChangedEventArgs>(&message) {
                        handler.handle_test_run_stats_change(args);
                    }
                }
                MessageType::ExecutionComplete => {
                    if let Some(complete) = payload::<TestRunCompletePayload>(&message) {
                        tracing::info!(
                            canceled = complete.test_run_complete_args.is_canceled,
                            aborted = complete.test_run_complete_args.is_aborted,
                            "test run complete"
                        );
                        handler.handle_test_run_complete(complete);
                        return Ok(());
                    }
                }
                MessageType::TestMessage => {
                    if let Some(log) = payload::<TestMessagePayload>(&message) {
                        handler.handle_log_message(log.message_level, &log.message);
                    }
                }
                MessageType::LaunchAdapterProcessWithDebuggerAttached => {
                    if let Some(start_info) = payload::<TestProcessStartInfo>(&message) {
                        self.answer_launch(&start_info, launcher)?;
                    }
                }
                MessageType::AttachDebugger => {
                    if let Some(request) = payload::<TestProcessAttachDebuggerPayload>(&message) {
                        self.answer_attach(&request, launcher)?;
                    }
                }
                other => tracing::debug!(message_type = %other, "ignoring message during test run"),
            }
        }
    }

    fn answer_launch(
        &self,
        start_info: &TestProcessStartInfo,
        launcher: &mut dyn DebuggerLauncher,
    ) -> Result<(), RunnerError> {
        let process_id = launcher
            .launch_process_with_debugger_attached(start_info)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, file_name = %start_info.file_name, "could not launch process under debugger");
                -1
            });
        self.send(
            MessageType::LaunchAdapterProcessWithDebuggerAttachedCallback,
            &process_id,
        )
    }

    fn answer_attach(
        &self,
        request: &TestProcessAttachDebuggerPayload,
        launcher: &mut dyn DebuggerLauncher,
    ) -> Result<(), RunnerError> {
        let ack = match launcher.attach_debugger_to_process(request) {
            Ok(attached) => AttachDebuggerAckPayload {
                attached,
                error_message: None,
            },
            Err(e) => {
                tracing::warn!(error = %e, process_id = request.process_id, "could not attach debugger");
                AttachDebuggerAckPayload {
                    attached: false,
                    error_message: Some(format!("{e:#}")),
                }
            }
        };
        self.send(MessageType::AttachDebuggerCallback, &ack)
    }

    pub fn send_test_run_cancel(&self) -> Result<(), RunnerError> {
        self.send_message(MessageType::CancelTestRun)
    }

    pub fn send_test_run_abort(&self) -> Result<(), RunnerError> {
        self.send_message(MessageType::AbortTestRun)
    }

    /// Tell the host to abandon the session without closing the connection
    pub fn send_session_abort(&self) -> Result<(), RunnerError> {
        self.send_message(MessageType::SessionAbort)
    }

    /// Ask the host to end the session, wait for it to hang up, then close
    #[tracing::instrument(skip(self))]
    pub fn end_session(&self) -> Result<(), RunnerError> {
        let events = self.events()?;
        self.send_message(MessageType::SessionEnd)?;

        let deadline = Instant::now() + self.options.session_end_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match next_message(&events, remaining) {
                Ok(Some(message)) => {
                    tracing::debug!(message_type = %message.message_type, "message after session end");
                }
                Ok(None) => {
                    tracing::warn!("test host did not close the connection after session end");
                    break;
                }
                Err(RunnerError::HostDisconnected(_)) => break,
                Err(e) => return Err(e),
            }
        }

        self.close();
        Ok(())
    }

    /// Stop the connection and endpoint. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("closing request sender");
        if let Some(channel) = lock(&self.channel).as_ref() {
            channel.stop();
        }
        lock(&self.endpoint).stop();
    }

    fn send<T>(&self, message_type: MessageType, payload: &T) -> Result<(), RunnerError>
    where
        T: Serialize + ?Sized,
    {
        let text =
            protocol::serialize_versioned_payload(message_type.clone(), payload, self.protocol_version())?;
        tracing::debug!(%message_type, "sending request");
        self.channel()?.send(&text)?;
        Ok(())
    }

    fn send_message(&self, message_type: MessageType) -> Result<(), RunnerError> {
        let text = Message::new(message_type.clone())
            .versioned(self.protocol_version())
            .to_frame_text()?;
        tracing::debug!(%message_type, "sending request");
        self.channel()?.send(&text)?;
        Ok(())
    }

    fn channel(&self) -> Result<Channel, RunnerError> {
        lock(&self.channel).clone().ok_or(RunnerError::NotConnected)
    }

    fn events(&self) -> Result<Receiver<ChannelEvent>, RunnerError> {
        lock(&self.events).clone().ok_or(RunnerError::NotConnected)
    }
}

impl Drop for RequestSender {
    fn drop(&mut self) {
        self.close();
    }
}

/// Next well-formed message, or `None` once `timeout` has passed
fn next_message(
    events: &Receiver<ChannelEvent>,
    timeout: Duration,
) -> Result<Option<Message>, RunnerError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(ChannelEvent::MessageReceived(raw)) => match protocol::deserialize_message(&raw) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => tracing::warn!(error = %e, "dropping malformed message"),
            },
            Ok(ChannelEvent::Disconnected { error }) => {
                return Err(RunnerError::HostDisconnected(error));
            }
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => return Err(RunnerError::HostDisconnected(None)),
        }
    }
}

/// Next well-formed message, however long it takes
fn wait_for_message(events: &Receiver<ChannelEvent>) -> Result<Message, RunnerError> {
    loop {
        match events.recv() {
            Ok(ChannelEvent::MessageReceived(raw)) => match protocol::deserialize_message(&raw) {
                Ok(message) => return Ok(message),
                Err(e) => tracing::warn!(error = %e, "dropping malformed message"),
            },
            Ok(ChannelEvent::Disconnected { error }) => {
                return Err(RunnerError::HostDisconnected(error));
            }
            Err(_) => return Err(RunnerError::HostDisconnected(None)),
        }
    }
}

fn payload<T>(message: &Message) -> Option<T>
where
    T: DeserializeOwned,
{
    message
        .payload_as::<T>()
        .inspect_err(|e| tracing::warn!(error = %e, "dropping message with unexpected payload"))
        .ok()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
