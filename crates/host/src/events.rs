//! Event handlers given to the managers, forwarding everything to the runner
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use protocol::payloads::{
    AttachmentSet, DiscoveryCompleteEventArgs, TestCase, TestMessageLevel, TestProcessStartInfo,
    TestRunChangedEventArgs, TestRunCompleteEventArgs,
};

use crate::DebuggerError;
use crate::managers::{DiscoveryEventsHandler, MessageLogger, RunEventsHandler};
use crate::session::Session;

pub(crate) struct DiscoveryEventsAdapter {
    session: Arc<Session>,
    completed: AtomicBool,
}

impl DiscoveryEventsAdapter {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            completed: AtomicBool::new(false),
        }
    }

    pub(crate) fn completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

impl MessageLogger for DiscoveryEventsAdapter {
    fn send_message(&self, level: TestMessageLevel, message: &str) {
        self.session.send_log(level, message);
    }
}

impl DiscoveryEventsHandler for DiscoveryEventsAdapter {
    fn handle_discovered_tests(&self, tests: Vec<TestCase>) {
        self.session.send_discovered_tests(&tests);
    }

    fn handle_discovery_complete(&self, args: DiscoveryCompleteEventArgs, last_chunk: Vec<TestCase>) {
        if self.completed.swap(true, Ordering::SeqCst) {
            tracing::warn!("discovery reported completion twice");
            return;
        }
        self.session.discovery_complete(args, last_chunk);
    }
}

pub(crate) struct RunEventsAdapter {
    session: Arc<Session>,
    completed: AtomicBool,
}

impl RunEventsAdapter {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            completed: AtomicBool::new(false),
        }
    }

    pub(crate) fn completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

impl MessageLogger for RunEventsAdapter {
    fn send_message(&self, level: TestMessageLevel, message: &str) {
        self.session.send_log(level, message);
    }
}

impl RunEventsHandler for RunEventsAdapter {
    fn handle_test_run_stats_change(&self, args: TestRunChangedEventArgs) {
        self.session.send_test_run_statistics(&args);
    }

    fn handle_test_run_complete(
        &self,
        args: TestRunCompleteEventArgs,
        last_chunk: Option<TestRunChangedEventArgs>,
        run_attachments: Vec<AttachmentSet>,
        executor_uris: Vec<String>,
    ) {
        if self.completed.swap(true, Ordering::SeqCst) {
            tracing::warn!("test run reported completion twice");
            return;
        }
        self.session
            .send_execution_complete(args, last_chunk, run_attachments, executor_uris);
    }

    fn launch_process_with_debugger_attached(
        &self,
        start_info: TestProcessStartInfo,
    ) -> Result<i32, DebuggerError> {
        self.session.launch_process_with_debugger_attached(start_info)
    }

    fn attach_debugger_to_process(&self, process_id: i32) -> Result<bool, DebuggerError> {
        self.session.attach_debugger_to_process(process_id)
    }
}

/// Logger used while initializing managers
pub(crate) struct SessionLogger(pub(crate) Arc<Session>);

impl MessageLogger for SessionLogger {
    fn send_message(&self, level: TestMessageLevel, message: &str) {
        self.0.send_log(level, message);
    }
}
