#![allow(dead_code)]

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use host::{
    DiscoveryManager, ExecutionManager, ManagerFactory, MessageLogger, TestRunRequest,
    TestRunTarget,
};
use protocol::payloads::{
    DiscoveryCompleteEventArgs, DiscoveryCompletePayload, DiscoveryCriteria, TestCase,
    TestMessageLevel, TestOutcome, TestProcessAttachDebuggerPayload, TestProcessStartInfo,
    TestResult, TestRunChangedEventArgs, TestRunCompleteEventArgs, TestRunCompletePayload,
    TestRunStatistics,
};
use runner::{DebuggerLauncher, DiscoveryEventsHandler, RunEventsHandler, TestMessageHandler};
use tracing_subscriber::EnvFilter;

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

    let _ = color_eyre::install();
}

/// Everything a runner handler was told
#[derive(Debug, Default)]
pub struct Recorder {
    pub logs: Vec<(TestMessageLevel, String)>,
    pub discovered: Vec<TestCase>,
    pub discovery_complete: Option<DiscoveryCompletePayload>,
    pub stats: Vec<TestRunChangedEventArgs>,
    pub run_complete: Option<TestRunCompletePayload>,
}

impl TestMessageHandler for Recorder {
    fn handle_log_message(&mut self, level: TestMessageLevel, message: &str) {
        self.logs.push((level, message.to_string()));
    }
}

impl DiscoveryEventsHandler for Recorder {
    fn handle_discovered_tests(&mut self, tests: Vec<TestCase>) {
        self.discovered.extend(tests);
    }

    fn handle_discovery_complete(&mut self, complete: DiscoveryCompletePayload) {
        assert!(self.discovery_complete.is_none(), "discovery completed twice");
        self.discovery_complete = Some(complete);
    }
}

impl RunEventsHandler for Recorder {
    fn handle_test_run_stats_change(&mut self, args: TestRunChangedEventArgs) {
        assert!(self.run_complete.is_none(), "statistics after completion");
        self.stats.push(args);
    }

    fn handle_test_run_complete(&mut self, complete: TestRunCompletePayload) {
        assert!(self.run_complete.is_none(), "run completed twice");
        self.run_complete = Some(complete);
    }
}

/// Pretends to start processes under a debugger
#[derive(Debug, Default)]
pub struct FakeLauncher {
    pub launched: Vec<TestProcessStartInfo>,
    pub attached: Vec<i32>,
}

impl DebuggerLauncher for FakeLauncher {
    fn launch_process_with_debugger_attached(
        &mut self,
        start_info: &TestProcessStartInfo,
    ) -> eyre::Result<i32> {
        self.launched.push(start_info.clone());
        Ok(4242)
    }

    fn attach_debugger_to_process(
        &mut self,
        request: &TestProcessAttachDebuggerPayload,
    ) -> eyre::Result<bool> {
        self.attached.push(request.process_id);
        Ok(true)
    }
}

pub fn test_case(name: &str) -> TestCase {
    TestCase::new(name, "executor://sample", "sample.dll")
}

/// Finds `<source>.First` and `<source>.Second` in every source
#[derive(Default)]
pub struct SampleDiscovery;

impl DiscoveryManager for SampleDiscovery {
    fn initialize(&self, _extension_paths: Vec<String>, logger: &dyn MessageLogger) -> eyre::Result<()> {
        logger.send_message(TestMessageLevel::Informational, "sample adapter loaded");
        Ok(())
    }

    fn discover_tests(
        &self,
        criteria: DiscoveryCriteria,
        handler: &dyn host::DiscoveryEventsHandler,
    ) -> eyre::Result<()> {
        let tests: Vec<TestCase> = criteria
            .sources
            .iter()
            .flat_map(|source| {
                [
                    TestCase::new(format!("{source}.First"), "executor://sample", source.as_str()),
                    TestCase::new(format!("{source}.Second"), "executor://sample", source.as_str()),
                ]
            })
            .collect();
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
    }
}

/// Passes every test. Debug runs launch the test process through the
/// runner first; a test named `Slow` runs until the run is canceled.
pub struct SampleExecution {
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
}

impl Default for SampleExecution {
    fn default() -> Self {
        let (cancel_tx, cancel_rx) = crossbeam_channel::unbounded();
        Self { cancel_tx, cancel_rx }
    }
}

impl ExecutionManager for SampleExecution {
    fn initialize(&self, _extension_paths: Vec<String>, _logger: &dyn MessageLogger) -> eyre::Result<()> {
        Ok(())
    }

    fn start_test_run(
        &self,
        request: TestRunRequest,
        handler: &dyn host::RunEventsHandler,
    ) -> eyre::Result<()> {
        if request.execution_context.is_debug {
            let process_id = handler.launch_process_with_debugger_attached(TestProcessStartInfo {
                file_name: "sample-testhost".to_string(),
                ..Default::default()
            })?;
            handler.attach_debugger_to_process(process_id)?;
        }

        let tests = match request.target {
            TestRunTarget::Tests(tests) => tests,
            TestRunTarget::Sources(sources) => sources
                .values()
                .flatten()
                .map(|source| TestCase::new(format!("{source}.First"), "executor://sample", source.as_str()))
                .collect(),
        };

        let mut results = Vec::new();
        let mut canceled = false;
        for test in tests {
            if test.fully_qualified_name == "Slow" {
                canceled = self.cancel_rx.recv_timeout(WAIT).is_ok();
                break;
            }
            let result = TestResult::new(test, TestOutcome::Passed);
            results.push(result.clone());
            handler.handle_test_run_stats_change(TestRunChangedEventArgs {
                new_test_results: vec![result],
                test_run_statistics: Some(TestRunStatistics::from_results(&results)),
                active_tests: Vec::new(),
            });
        }

        handler.handle_test_run_complete(
            TestRunCompleteEventArgs {
                test_run_statistics: Some(TestRunStatistics::from_results(&results)),
                is_canceled: canceled,
                ..Default::default()
            },
            None,
            Vec::new(),
            vec!["executor://sample".to_string()],
        );
        Ok(())
    }

    fn cancel(&self, _handler: &dyn host::RunEventsHandler) {
        let _ = self.cancel_tx.send(());
    }

    fn abort(&self, _handler: &dyn host::RunEventsHandler) {
        let _ = self.cancel_tx.send(());
    }
}

#[derive(Default)]
pub struct SampleManagers {
    discovery: Arc<SampleDiscovery>,
    execution: Arc<SampleExecution>,
}

impl ManagerFactory for SampleManagers {
    fn discovery_manager(&self) -> Arc<dyn DiscoveryManager> {
        self.discovery.clone()
    }

    fn execution_manager(&self) -> Arc<dyn ExecutionManager> {
        self.execution.clone()
    }
}
