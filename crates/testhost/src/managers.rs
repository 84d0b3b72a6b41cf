//! Managers used when no test adapters are installed
use std::sync::Arc;

use host::{
    DiscoveryEventsHandler, DiscoveryManager, ExecutionManager, ManagerFactory, MessageLogger,
    RunEventsHandler, TestRunRequest,
};
use protocol::payloads::{
    DiscoveryCompleteEventArgs, DiscoveryCriteria, TestMessageLevel, TestRunCompleteEventArgs,
    TestRunStatistics,
};

/// Finds nothing and runs nothing, telling the runner why
#[derive(Debug, Default)]
pub struct NoAdapters;

impl DiscoveryManager for NoAdapters {
    fn initialize(&self, extension_paths: Vec<String>, _logger: &dyn MessageLogger) -> eyre::Result<()> {
        tracing::debug!(?extension_paths, "ignoring extensions");
        Ok(())
    }

    fn discover_tests(
        &self,
        criteria: DiscoveryCriteria,
        handler: &dyn DiscoveryEventsHandler,
    ) -> eyre::Result<()> {
        for source in &criteria.sources {
            handler.send_message(
                TestMessageLevel::Warning,
                &format!("no test adapter available for {source}"),
            );
        }
        handler.handle_discovery_complete(
            DiscoveryCompleteEventArgs {
                total_count: 0,
                is_aborted: false,
                metrics: None,
            },
            Vec::new(),
        );
        Ok(())
    }
}

impl ExecutionManager for NoAdapters {
    fn initialize(&self, extension_paths: Vec<String>, _logger: &dyn MessageLogger) -> eyre::Result<()> {
        tracing::debug!(?extension_paths, "ignoring extensions");
        Ok(())
    }

    fn start_test_run(&self, request: TestRunRequest, handler: &dyn RunEventsHandler) -> eyre::Result<()> {
        tracing::debug!(run_target = ?request.target, "nothing to run");
        handler.send_message(TestMessageLevel::Warning, "no test adapter available");
        handler.handle_test_run_complete(
            TestRunCompleteEventArgs {
                test_run_statistics: Some(TestRunStatistics::default()),
                ..Default::default()
            },
            None,
            Vec::new(),
            Vec::new(),
        );
        Ok(())
    }

    fn cancel(&self, _handler: &dyn RunEventsHandler) {
        tracing::debug!("nothing to cancel");
    }

    fn abort(&self, _handler: &dyn RunEventsHandler) {
        tracing::debug!("nothing to abort");
    }
}

#[derive(Default)]
pub struct DefaultManagers {
    managers: Arc<NoAdapters>,
}

impl ManagerFactory for DefaultManagers {
    fn discovery_manager(&self) -> Arc<dyn DiscoveryManager> {
        self.managers.clone()
    }

    fn execution_manager(&self) -> Arc<dyn ExecutionManager> {
        self.managers.clone()
    }
}
