//! Callbacks through which a [`crate::RequestSender`] reports what the test
//! host sends back

use protocol::payloads::{
    DiscoveryCompletePayload, TestCase, TestMessageLevel, TestProcessAttachDebuggerPayload,
    TestProcessStartInfo, TestRunChangedEventArgs, TestRunCompletePayload,
};

pub trait TestMessageHandler {
    fn handle_log_message(&mut self, level: TestMessageLevel, message: &str);
}

pub trait DiscoveryEventsHandler: TestMessageHandler {
    fn handle_discovered_tests(&mut self, tests: Vec<TestCase>);

    /// Called once per discovery. A host that goes away mid-discovery is
    /// reported here as an aborted completion.
    fn handle_discovery_complete(&mut self, complete: DiscoveryCompletePayload);
}

pub trait RunEventsHandler: TestMessageHandler {
    fn handle_test_run_stats_change(&mut self, args: TestRunChangedEventArgs);

    /// Called once per run, with `IsAborted` set if the host went away
    fn handle_test_run_complete(&mut self, complete: TestRunCompletePayload);
}

/// Starts processes under, or attaches, the runner's debugger on behalf of
/// the test host
pub trait DebuggerLauncher {
    /// Returns the id of the started process
    fn launch_process_with_debugger_attached(
        &mut self,
        start_info: &TestProcessStartInfo,
    ) -> eyre::Result<i32>;

    fn attach_debugger_to_process(
        &mut self,
        request: &TestProcessAttachDebuggerPayload,
    ) -> eyre::Result<bool>;
}

/// Refuses every debugger request
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDebugger;

impl DebuggerLauncher for NoDebugger {
    fn launch_process_with_debugger_attached(
        &mut self,
        start_info: &TestProcessStartInfo,
    ) -> eyre::Result<i32> {
        eyre::bail!("no debugger available to launch {}", start_info.file_name)
    }

    fn attach_debugger_to_process(
        &mut self,
        request: &TestProcessAttachDebuggerPayload,
    ) -> eyre::Result<bool> {
        eyre::bail!("no debugger available to attach to {}", request.process_id)
    }
}
