//! Payload types carried by protocol messages.
//!
//! All payloads use PascalCase field names on the wire, matching the
//! envelope itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Payload of the host's reply to `VersionCheck`.
///
/// Normally the bare negotiated version. If diagnostics could not be enabled
/// during the handshake the host still acknowledges, but attaches the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandshakeAck {
    Version(u32),
    #[serde(rename_all = "PascalCase")]
    WithDiagnosticsError {
        version: u32,
        diagnostics_error: String,
    },
}

impl HandshakeAck {
    pub fn version(&self) -> u32 {
        match self {
            HandshakeAck::Version(version) => *version,
            HandshakeAck::WithDiagnosticsError { version, .. } => *version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TestOutcome {
    None,
    Passed,
    Failed,
    Skipped,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Trait {
    pub name: String,
    pub value: String,
}

/// A single test as known to the runner and the adapters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestCase {
    pub id: Uuid,
    pub fully_qualified_name: String,
    pub display_name: String,
    pub executor_uri: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traits: Vec<Trait>,
}

impl TestCase {
    pub fn new(
        fully_qualified_name: impl Into<String>,
        executor_uri: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let fully_qualified_name = fully_qualified_name.into();
        Self {
            id: Uuid::new_v4(),
            display_name: fully_qualified_name.clone(),
            fully_qualified_name,
            executor_uri: executor_uri.into(),
            source: source.into(),
            code_file_path: None,
            line_number: None,
            traits: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestSessionInfo {
    pub id: Uuid,
}

fn default_discovered_tests_frequency() -> u64 {
    10
}

fn default_discovered_tests_timeout_ms() -> u64 {
    1500
}

/// Payload of `StartDiscovery`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryCriteria {
    pub sources: Vec<String>,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub run_settings: Option<String>,
    #[serde(default)]
    pub test_case_filter: Option<String>,
    /// Number of discovered tests to batch into one `DiscoveredTests` message
    #[serde(default = "default_discovered_tests_frequency")]
    pub frequency_of_discovered_tests_event: u64,
    #[serde(default = "default_discovered_tests_timeout_ms")]
    pub discovered_tests_event_timeout_ms: u64,
    #[serde(default)]
    pub test_session_info: Option<TestSessionInfo>,
}

impl DiscoveryCriteria {
    pub fn for_sources<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            package: None,
            run_settings: None,
            test_case_filter: None,
            frequency_of_discovered_tests_event: default_discovered_tests_frequency(),
            discovered_tests_event_timeout_ms: default_discovered_tests_timeout_ms(),
            test_session_info: None,
        }
    }
}

/// Completion information produced by a discovery manager
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryCompleteEventArgs {
    /// Total number of tests discovered, or -1 when discovery was aborted
    pub total_count: i64,
    pub is_aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, Value>>,
}

/// Payload of `DiscoveryComplete`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryCompletePayload {
    pub total_tests: i64,
    #[serde(default)]
    pub last_discovered_tests: Vec<TestCase>,
    pub is_aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, Value>>,
}

fn default_run_stats_frequency() -> u64 {
    10
}

fn default_run_stats_timeout_ms() -> u64 {
    1500
}

/// How a test run should be carried out by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestExecutionContext {
    #[serde(default = "default_run_stats_frequency")]
    pub frequency_of_run_stats_change_event: u64,
    #[serde(default = "default_run_stats_timeout_ms")]
    pub run_stats_change_event_timeout_ms: u64,
    #[serde(default)]
    pub in_isolation: bool,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub are_test_case_level_events_required: bool,
    #[serde(default)]
    pub is_debug: bool,
    #[serde(default)]
    pub test_case_filter: Option<String>,
}

impl Default for TestExecutionContext {
    fn default() -> Self {
        Self {
            frequency_of_run_stats_change_event: default_run_stats_frequency(),
            run_stats_change_event_timeout_ms: default_run_stats_timeout_ms(),
            in_isolation: false,
            keep_alive: false,
            are_test_case_level_events_required: false,
            is_debug: false,
            test_case_filter: None,
        }
    }
}

/// Payload of `StartTestExecutionWithSources`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCriteriaWithSources {
    /// Sources to run, keyed by the adapter (or `_none_`) that should handle them
    pub adapter_source_map: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub run_settings: Option<String>,
    #[serde(default)]
    pub test_execution_context: TestExecutionContext,
    #[serde(default)]
    pub test_session_info: Option<TestSessionInfo>,
}

/// Payload of `StartTestExecutionWithTests`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCriteriaWithTests {
    pub tests: Vec<TestCase>,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub run_settings: Option<String>,
    #[serde(default)]
    pub test_execution_context: TestExecutionContext,
    #[serde(default)]
    pub test_session_info: Option<TestSessionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UriDataAttachment {
    pub uri: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A named group of attachments produced by one data collector or adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttachmentSet {
    pub uri: String,
    pub display_name: String,
    #[serde(default)]
    pub attachments: Vec<UriDataAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestResultMessage {
    pub category: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestResult {
    pub test_case: TestCase,
    pub outcome: TestOutcome,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_stack_trace: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub messages: Vec<TestResultMessage>,
    #[serde(default)]
    pub attachments: Vec<AttachmentSet>,
}

impl TestResult {
    pub fn new(test_case: TestCase, outcome: TestOutcome) -> Self {
        Self {
            test_case,
            outcome,
            error_message: None,
            error_stack_trace: None,
            display_name: None,
            duration_ms: 0,
            messages: Vec::new(),
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunStatistics {
    pub executed_tests: i64,
    #[serde(default)]
    pub stats: BTreeMap<TestOutcome, i64>,
}

impl TestRunStatistics {
    /// Tally a batch of results
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a TestResult>) -> Self {
        let mut statistics = Self::default();
        for result in results {
            statistics.executed_tests += 1;
            *statistics.stats.entry(result.outcome).or_default() += 1;
        }
        statistics
    }

    pub fn count(&self, outcome: TestOutcome) -> i64 {
        self.stats.get(&outcome).copied().unwrap_or_default()
    }
}

/// Payload of `TestRunStatsChange`, also used for the last chunk of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunChangedEventArgs {
    #[serde(default)]
    pub new_test_results: Vec<TestResult>,
    #[serde(default)]
    pub test_run_statistics: Option<TestRunStatistics>,
    #[serde(default)]
    pub active_tests: Vec<TestCase>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCompleteEventArgs {
    #[serde(default)]
    pub test_run_statistics: Option<TestRunStatistics>,
    pub is_canceled: bool,
    pub is_aborted: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub attachment_sets: Vec<AttachmentSet>,
    #[serde(default)]
    pub elapsed_time_ms: u64,
}

/// Payload of `ExecutionComplete`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCompletePayload {
    pub test_run_complete_args: TestRunCompleteEventArgs,
    #[serde(default)]
    pub last_run_tests: Option<TestRunChangedEventArgs>,
    #[serde(default)]
    pub run_attachments: Vec<AttachmentSet>,
    #[serde(default)]
    pub executor_uris: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMessageLevel {
    Informational,
    Warning,
    Error,
}

/// Payload of `TestMessage`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestMessagePayload {
    pub message_level: TestMessageLevel,
    pub message: String,
}

/// Payload of `LaunchAdapterProcessWithDebuggerAttached`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestProcessStartInfo {
    pub file_name: String,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
}

/// Payload of `AttachDebugger`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestProcessAttachDebuggerPayload {
    pub process_id: i32,
    #[serde(default)]
    pub target_framework: Option<String>,
}

/// Payload of `AttachDebuggerCallback`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttachDebuggerAckPayload {
    pub attached: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}
