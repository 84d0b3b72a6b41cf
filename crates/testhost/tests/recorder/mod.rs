use protocol::payloads::{DiscoveryCompletePayload, TestCase, TestMessageLevel};
use runner::{DiscoveryEventsHandler, TestMessageHandler};

#[derive(Debug, Default)]
pub struct Recorder {
    pub logs: Vec<(TestMessageLevel, String)>,
    pub discovered: Vec<TestCase>,
    pub discovery_complete: Option<DiscoveryCompletePayload>,
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
        self.discovery_complete = Some(complete);
    }
}
