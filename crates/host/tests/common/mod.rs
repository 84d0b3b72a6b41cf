#![allow(dead_code)]

use std::{
    io::IsTerminal,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use eyre::WrapErr;
use host::{
    DiscoveryEventsHandler, DiscoveryManager, ExecutionManager, HandlerOptions, ManagerFactory,
    MessageLogger, RequestHandler, RunEventsHandler, TestRunRequest,
};
use protocol::{
    Message, MessageType,
    payloads::{DiscoveryCompleteEventArgs, DiscoveryCriteria, TestCase, TestRunCompleteEventArgs},
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use transport::{Channel, ChannelEvent, InMemoryEndpoint, InMemoryTransport};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_test_logger() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    // error traces
    let _ = color_eyre::install();
}

pub fn test_case(name: &str) -> TestCase {
    TestCase::new(name, "executor://fake", "test.dll")
}

type DiscoverFn =
    dyn Fn(&DiscoveryCriteria, &dyn DiscoveryEventsHandler) -> eyre::Result<()> + Send + Sync;
type RunFn = dyn Fn(&TestRunRequest, &dyn RunEventsHandler) -> eyre::Result<()> + Send + Sync;

/// Discovery manager recording its calls
pub struct FakeDiscovery {
    pub initialized: Mutex<Vec<Vec<String>>>,
    pub criteria: Mutex<Vec<DiscoveryCriteria>>,
    behaviour: Box<DiscoverFn>,
}

impl FakeDiscovery {
    pub fn with<F>(behaviour: F) -> Self
    where
        F: Fn(&DiscoveryCriteria, &dyn DiscoveryEventsHandler) -> eyre::Result<()>
            + Send
            + Sync
            + 'static,
    {
        Self {
            initialized: Mutex::default(),
            criteria: Mutex::default(),
            behaviour: Box::new(behaviour),
        }
    }

    /// Finds one test in every source
    pub fn finding_one_test() -> Self {
        Self::with(|criteria, handler| {
            let tests = criteria
                .sources
                .iter()
                .map(|source| test_case(&format!("{source}.Test1")))
                .collect::<Vec<_>>();
            handler.handle_discovered_tests(tests.clone());
            handler.handle_discovery_complete(
                DiscoveryCompleteEventArgs {
                    total_count: tests.len() as i64,
                    is_aborted: false,
                    metrics: None,
                },
                Vec::new(),
            );
            Ok(())
        })
    }

    pub fn calls(&self) -> usize {
        self.criteria.lock().unwrap().len() + self.initialized.lock().unwrap().len()
    }
}

impl DiscoveryManager for FakeDiscovery {
    fn initialize(&self, extension_paths: Vec<String>, _logger: &dyn MessageLogger) -> eyre::Result<()> {
        self.initialized.lock().unwrap().push(extension_paths);
        Ok(())
    }

    fn discover_tests(
        &self,
        criteria: DiscoveryCriteria,
        handler: &dyn DiscoveryEventsHandler,
    ) -> eyre::Result<()> {
        self.criteria.lock().unwrap().push(criteria.clone());
        (self.behaviour)(&criteria, handler)
    }
}

/// Execution manager recording its calls
pub struct FakeExecution {
    pub requests: Mutex<Vec<TestRunRequest>>,
    pub cancels: Mutex<usize>,
    pub aborts: Mutex<usize>,
    stop: Option<Sender<()>>,
    behaviour: Box<RunFn>,
}

impl FakeExecution {
    pub fn with<F>(behaviour: F) -> Self
    where
        F: Fn(&TestRunRequest, &dyn RunEventsHandler) -> eyre::Result<()> + Send + Sync + 'static,
    {
        Self {
            requests: Mutex::default(),
            cancels: Mutex::default(),
            aborts: Mutex::default(),
            stop: None,
            behaviour: Box::new(behaviour),
        }
    }

    /// Runs until `cancel` or `abort` is called, then completes as aborted
    pub fn until_stopped() -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::unbounded::<()>();
        let mut execution = Self::with(move |_, handler| {
            let stopped = stop_rx.recv_timeout(Duration::from_secs(30)).is_ok();
            handler.handle_test_run_complete(
                TestRunCompleteEventArgs {
                    is_aborted: stopped,
                    ..Default::default()
                },
                None,
                Vec::new(),
                Vec::new(),
            );
            Ok(())
        });
        execution.stop = Some(stop_tx);
        execution
    }

    pub fn started_runs(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Completes every run immediately
    pub fn completing() -> Self {
        Self::with(|_, handler| {
            handler.handle_test_run_complete(
                TestRunCompleteEventArgs::default(),
                None,
                Vec::new(),
                Vec::new(),
            );
            Ok(())
        })
    }
}

impl ExecutionManager for FakeExecution {
    fn initialize(&self, _extension_paths: Vec<String>, _logger: &dyn MessageLogger) -> eyre::Result<()> {
        Ok(())
    }

    fn start_test_run(&self, request: TestRunRequest, handler: &dyn RunEventsHandler) -> eyre::Result<()> {
        self.requests.lock().unwrap().push(request.clone());
        (self.behaviour)(&request, handler)
    }

    fn cancel(&self, _handler: &dyn RunEventsHandler) {
        *self.cancels.lock().unwrap() += 1;
        if let Some(stop) = &self.stop {
            let _ = stop.send(());
        }
    }

    fn abort(&self, _handler: &dyn RunEventsHandler) {
        *self.aborts.lock().unwrap() += 1;
        if let Some(stop) = &self.stop {
            let _ = stop.send(());
        }
    }
}

pub struct FakeFactory {
    pub discovery: Arc<FakeDiscovery>,
    pub execution: Arc<FakeExecution>,
}

impl FakeFactory {
    pub fn new(discovery: FakeDiscovery, execution: FakeExecution) -> Self {
        Self {
            discovery: Arc::new(discovery),
            execution: Arc::new(execution),
        }
    }
}

impl Default for FakeFactory {
    fn default() -> Self {
        Self::new(FakeDiscovery::finding_one_test(), FakeExecution::completing())
    }
}

impl ManagerFactory for FakeFactory {
    fn discovery_manager(&self) -> Arc<dyn DiscoveryManager> {
        self.discovery.clone()
    }

    fn execution_manager(&self) -> Arc<dyn ExecutionManager> {
        self.execution.clone()
    }
}

/// A request handler processing requests on a background thread, and the
/// runner end of its connection
pub struct Harness {
    pub handler: Arc<RequestHandler>,
    pub factory: Arc<FakeFactory>,
    runner: Channel,
    events: Receiver<ChannelEvent>,
    processing: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn start(factory: FakeFactory) -> eyre::Result<Self> {
        Self::start_with(factory, HandlerOptions::default(), |handler| handler)
    }

    pub fn start_with<F>(
        factory: FakeFactory,
        options: HandlerOptions,
        configure: F,
    ) -> eyre::Result<Self>
    where
        F: FnOnce(RequestHandler) -> RequestHandler,
    {
        let (host_side, runner_side) = InMemoryTransport::pair();
        let (endpoint, connected) = InMemoryEndpoint::new(host_side);
        let handler = RequestHandler::with_endpoint(Box::new(endpoint), connected, "in-memory", options)?;
        let handler = Arc::new(configure(handler));

        handler.initialize_communication()?;
        eyre::ensure!(
            handler.wait_for_request_sender_connection(WAIT),
            "runner did not connect"
        );

        let (runner, events) = Channel::with_transport(runner_side)?;
        let factory = Arc::new(factory);
        let processing = {
            let handler = Arc::clone(&handler);
            let factory = Arc::clone(&factory);
            thread::Builder::new()
                .name("process-requests".to_string())
                .spawn(move || handler.process_requests(factory.as_ref()))?
        };

        Ok(Self {
            handler,
            factory,
            runner,
            events,
            processing: Some(processing),
        })
    }

    pub fn send<T>(&self, message_type: MessageType, payload: &T) -> eyre::Result<()>
    where
        T: Serialize + ?Sized,
    {
        let text = protocol::serialize_payload(message_type, payload)?;
        self.runner.send(&text)?;
        Ok(())
    }

    pub fn send_message(&self, message_type: MessageType) -> eyre::Result<()> {
        self.runner.send(&protocol::serialize_message(message_type)?)?;
        Ok(())
    }

    pub fn send_raw(&self, text: &str) -> eyre::Result<()> {
        self.runner.send(text)?;
        Ok(())
    }

    pub fn recv(&self) -> eyre::Result<Message> {
        match self.events.recv_timeout(WAIT).wrap_err("waiting for host message")? {
            ChannelEvent::MessageReceived(raw) => Ok(protocol::deserialize_message(&raw)?),
            ChannelEvent::Disconnected { error } => {
                eyre::bail!("host disconnected: {error:?}")
            }
        }
    }

    /// Receive the next message, which must be of `message_type`
    pub fn expect(&self, message_type: MessageType) -> eyre::Result<Message> {
        let message = self.recv()?;
        eyre::ensure!(
            message.message_type == message_type,
            "expected {message_type}, got {message:?}"
        );
        Ok(message)
    }

    pub fn nothing_received_within(&self, timeout: Duration) -> bool {
        self.events.recv_timeout(timeout).is_err()
    }

    pub fn handshake(&self, version: u32) -> eyre::Result<Message> {
        self.send(MessageType::VersionCheck, &version)?;
        self.expect(MessageType::VersionCheck)
    }

    /// Wait until the host closes the connection
    pub fn expect_disconnect(&self) -> eyre::Result<()> {
        loop {
            match self.events.recv_timeout(WAIT)? {
                ChannelEvent::Disconnected { .. } => return Ok(()),
                ChannelEvent::MessageReceived(raw) => {
                    tracing::debug!(%raw, "message before disconnect");
                }
            }
        }
    }

    /// Close the runner side of the connection
    pub fn disconnect(&self) {
        self.runner.stop();
    }

    /// Wait for `process_requests` to return
    pub fn finished(&mut self) -> eyre::Result<()> {
        let processing = self
            .processing
            .take()
            .ok_or_else(|| eyre::eyre!("already joined"))?;
        let deadline = Instant::now() + WAIT;
        while !processing.is_finished() {
            eyre::ensure!(Instant::now() < deadline, "process_requests did not return");
            thread::sleep(Duration::from_millis(5));
        }
        processing
            .join()
            .map_err(|_| eyre::eyre!("process_requests panicked"))
    }

    /// Poll until `condition` holds
    pub fn wait_until<F>(&self, condition: F) -> eyre::Result<()>
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            eyre::ensure!(Instant::now() < deadline, "condition not met within {WAIT:?}");
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    pub fn is_processing(&self) -> bool {
        self.processing
            .as_ref()
            .is_some_and(|processing| !processing.is_finished())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.handler.cancel();
        if let Some(processing) = self.processing.take() {
            let _ = processing.join();
        }
    }
}
