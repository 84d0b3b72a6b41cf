//! Interfaces between the request handler and the code that actually
//! discovers and runs tests
//!
//! The handler owns the protocol; discovery and execution managers own test
//! adapters. Managers report progress through the handler traits below, and
//! the handler turns every call into an outgoing message.
use std::collections::BTreeMap;
use std::sync::Arc;

use protocol::payloads::{
    AttachmentSet, DiscoveryCompleteEventArgs, DiscoveryCriteria, TestCase, TestExecutionContext,
    TestMessageLevel, TestProcessStartInfo, TestRunChangedEventArgs, TestRunCompleteEventArgs,
    TestRunCriteriaWithSources, TestRunCriteriaWithTests, TestSessionInfo,
};

use crate::DebuggerError;

/// Sends free-form messages to the runner
pub trait MessageLogger: Send + Sync {
    fn send_message(&self, level: TestMessageLevel, message: &str);
}

/// Receives discovery progress from a [`DiscoveryManager`]
pub trait DiscoveryEventsHandler: MessageLogger {
    fn handle_discovered_tests(&self, tests: Vec<TestCase>);

    /// Must be called exactly once per discovery, after the last
    /// [`DiscoveryEventsHandler::handle_discovered_tests`]
    fn handle_discovery_complete(&self, args: DiscoveryCompleteEventArgs, last_chunk: Vec<TestCase>);
}

/// Receives run progress from an [`ExecutionManager`]
pub trait RunEventsHandler: MessageLogger {
    fn handle_test_run_stats_change(&self, args: TestRunChangedEventArgs);

    fn handle_test_run_complete(
        &self,
        args: TestRunCompleteEventArgs,
        last_chunk: Option<TestRunChangedEventArgs>,
        run_attachments: Vec<AttachmentSet>,
        executor_uris: Vec<String>,
    );

    /// Ask the runner to start `start_info` under a debugger; returns its process id
    fn launch_process_with_debugger_attached(
        &self,
        start_info: TestProcessStartInfo,
    ) -> Result<i32, DebuggerError>;

    /// Ask the runner to attach a debugger to a running process
    fn attach_debugger_to_process(&self, process_id: i32) -> Result<bool, DebuggerError>;
}

/// Finds tests in a set of sources
pub trait DiscoveryManager: Send + Sync {
    fn initialize(&self, extension_paths: Vec<String>, logger: &dyn MessageLogger)
    -> eyre::Result<()>;

    fn discover_tests(
        &self,
        criteria: DiscoveryCriteria,
        handler: &dyn DiscoveryEventsHandler,
    ) -> eyre::Result<()>;
}

/// What a test run should execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestRunTarget {
    /// Everything in these sources, keyed by adapter
    Sources(BTreeMap<String, Vec<String>>),
    /// Exactly these tests
    Tests(Vec<TestCase>),
}

/// One test run request, as received from the runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRunRequest {
    pub target: TestRunTarget,
    pub package: Option<String>,
    pub run_settings: Option<String>,
    pub test_session_info: Option<TestSessionInfo>,
    pub execution_context: TestExecutionContext,
}

impl From<TestRunCriteriaWithSources> for TestRunRequest {
    fn from(criteria: TestRunCriteriaWithSources) -> Self {
        Self {
            target: TestRunTarget::Sources(criteria.adapter_source_map),
            package: criteria.package,
            run_settings: criteria.run_settings,
            test_session_info: criteria.test_session_info,
            execution_context: criteria.test_execution_context,
        }
    }
}

impl From<TestRunCriteriaWithTests> for TestRunRequest {
    fn from(criteria: TestRunCriteriaWithTests) -> Self {
        Self {
            target: TestRunTarget::Tests(criteria.tests),
            package: criteria.package,
            run_settings: criteria.run_settings,
            test_session_info: criteria.test_session_info,
            execution_context: criteria.test_execution_context,
        }
    }
}

/// Runs tests.
///
/// `cancel` and `abort` are called from the request processing thread while
/// `start_test_run` is still running on another thread.
pub trait ExecutionManager: Send + Sync {
    fn initialize(&self, extension_paths: Vec<String>, logger: &dyn MessageLogger)
    -> eyre::Result<()>;

    fn start_test_run(&self, request: TestRunRequest, handler: &dyn RunEventsHandler)
    -> eyre::Result<()>;

    fn cancel(&self, handler: &dyn RunEventsHandler);

    fn abort(&self, handler: &dyn RunEventsHandler);
}

/// Supplies the managers for one session
pub trait ManagerFactory {
    fn discovery_manager(&self) -> Arc<dyn DiscoveryManager>;

    fn execution_manager(&self) -> Arc<dyn ExecutionManager>;
}

/// Turns on diagnostic logging when the runner connects
pub trait Diagnostics: Send + Sync {
    fn enable(&self) -> eyre::Result<()>;
}
