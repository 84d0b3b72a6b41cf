use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::Result;
use host::{DebuggerError, Diagnostics, HandlerOptions, RequestHandler, SessionState, Termination};
use protocol::MessageType;
use protocol::payloads::{
    DiscoveryCompletePayload, DiscoveryCriteria, HandshakeAck, TestProcessStartInfo,
    TestRunCompleteEventArgs, TestRunCriteriaWithTests,
};
use transport::{ConnectionInfo, ConnectionRole};

mod common;

use common::{FakeDiscovery, FakeExecution, FakeFactory, Harness, test_case};

#[ctor::ctor]
fn init() {
    common::init_test_logger();
}

fn options_supporting(highest_supported_version: u32) -> HandlerOptions {
    HandlerOptions {
        highest_supported_version,
        ..Default::default()
    }
}

#[test]
fn older_runner_gets_its_own_version() -> Result<()> {
    let harness = Harness::start_with(FakeFactory::default(), options_supporting(3), |h| h)?;

    let ack = harness.handshake(1)?;
    assert_eq!(ack.version, None);
    assert_eq!(ack.payload_as::<HandshakeAck>()?, HandshakeAck::Version(1));
    assert_eq!(harness.handler.protocol_version(), 1);
    assert_eq!(harness.handler.state(), SessionState::Ready);

    // version 1 is never written on the wire
    harness.send(MessageType::StartDiscovery, &DiscoveryCriteria::for_sources(["test.dll"]))?;
    harness.expect(MessageType::DiscoveredTests)?;
    let complete = harness.expect(MessageType::DiscoveryComplete)?;
    assert_eq!(complete.version, None);
    Ok(())
}

#[test]
fn newer_runner_is_capped_at_local_version() -> Result<()> {
    let harness = Harness::start_with(FakeFactory::default(), options_supporting(3), |h| h)?;

    let ack = harness.handshake(5)?;
    assert_eq!(ack.payload_as::<HandshakeAck>()?.version(), 3);
    assert_eq!(ack.version, None, "the acknowledgement itself is unversioned");

    harness.send(MessageType::StartDiscovery, &DiscoveryCriteria::for_sources(["test.dll"]))?;
    let discovered = harness.expect(MessageType::DiscoveredTests)?;
    assert_eq!(discovered.version, Some(3));
    let complete = harness.expect(MessageType::DiscoveryComplete)?;
    assert_eq!(complete.version, Some(3));
    Ok(())
}

#[test]
fn version_zero_negotiates_base_version() -> Result<()> {
    let harness = Harness::start(FakeFactory::default())?;

    let ack = harness.handshake(0)?;
    assert_eq!(ack.payload_as::<u32>()?, protocol::BASE_PROTOCOL_VERSION);
    Ok(())
}

#[test]
fn repeated_version_check_is_ignored() -> Result<()> {
    let harness = Harness::start_with(FakeFactory::default(), options_supporting(3), |h| h)?;
    harness.handshake(2)?;

    harness.send(MessageType::VersionCheck, &6u32)?;
    assert!(harness.nothing_received_within(Duration::from_millis(200)));
    assert_eq!(harness.handler.protocol_version(), 2);
    Ok(())
}

#[test]
fn requests_before_handshake_are_dropped() -> Result<()> {
    let harness = Harness::start(FakeFactory::default())?;

    harness.send(MessageType::StartDiscovery, &DiscoveryCriteria::for_sources(["test.dll"]))?;
    let ack = harness.handshake(6)?;
    assert_eq!(ack.payload_as::<u32>()?, 6);

    assert!(harness.nothing_received_within(Duration::from_millis(200)));
    assert_eq!(harness.factory.discovery.calls(), 0);
    Ok(())
}

#[test]
fn unknown_and_malformed_messages_do_not_end_the_session() -> Result<()> {
    let mut harness = Harness::start(FakeFactory::default())?;
    harness.handshake(6)?;

    harness.send_raw(r#"{"MessageType":"TestExecution.Unheard","Payload":{"A":1}}"#)?;
    harness.send_raw("this is not json")?;
    harness.send_raw(r#"{"MessageType":"StartDiscovery","Payload":"wrong shape"}"#)?;

    // still answering
    harness.send(MessageType::StartDiscovery, &DiscoveryCriteria::for_sources(["test.dll"]))?;
    harness.expect(MessageType::DiscoveredTests)?;
    harness.expect(MessageType::DiscoveryComplete)?;

    harness.send_message(MessageType::SessionEnd)?;
    harness.expect_disconnect()?;
    harness.finished()?;
    assert_eq!(harness.handler.termination(), Some(Termination::Clean));
    Ok(())
}

#[test]
fn session_end_is_terminal() -> Result<()> {
    let mut harness = Harness::start(FakeFactory::default())?;
    harness.handshake(6)?;

    harness.send_message(MessageType::SessionEnd)?;
    harness.send(MessageType::StartDiscovery, &DiscoveryCriteria::for_sources(["late.dll"]))?;

    harness.expect_disconnect()?;
    harness.finished()?;
    assert_eq!(harness.handler.state(), SessionState::Ended);
    assert_eq!(harness.factory.discovery.calls(), 0);
    Ok(())
}

#[test]
fn session_end_before_handshake_ends_cleanly() -> Result<()> {
    let mut harness = Harness::start(FakeFactory::default())?;

    harness.send_message(MessageType::SessionEnd)?;
    harness.expect_disconnect()?;
    harness.finished()?;
    assert_eq!(harness.handler.termination(), Some(Termination::Clean));
    Ok(())
}

#[test]
fn session_abort_keeps_the_connection() -> Result<()> {
    let harness = Harness::start(FakeFactory::default())?;
    harness.handshake(6)?;

    harness.send_message(MessageType::SessionAbort)?;
    harness.send(MessageType::StartDiscovery, &DiscoveryCriteria::for_sources(["test.dll"]))?;

    harness.expect(MessageType::DiscoveredTests)?;
    let complete = harness
        .expect(MessageType::DiscoveryComplete)?
        .payload_as::<DiscoveryCompletePayload>()?;
    assert_eq!(complete.total_tests, 1);
    assert!(harness.is_processing());
    assert_eq!(harness.handler.termination(), None);
    Ok(())
}

#[test]
fn runner_disconnect_ends_abnormally() -> Result<()> {
    let mut harness = Harness::start(FakeFactory::default())?;
    harness.handshake(6)?;

    harness.disconnect();
    harness.finished()?;
    assert_eq!(harness.handler.termination(), Some(Termination::Abnormal));
    Ok(())
}

#[test]
fn cancel_releases_request_processing() -> Result<()> {
    let mut harness = Harness::start(FakeFactory::default())?;
    harness.handshake(6)?;

    harness.handler.cancel();
    harness.finished()?;
    harness.expect_disconnect()?;
    assert_eq!(harness.handler.termination(), Some(Termination::Canceled));

    // idempotent
    harness.handler.cancel();
    harness.handler.close();
    Ok(())
}

fn one_test_run() -> TestRunCriteriaWithTests {
    TestRunCriteriaWithTests {
        tests: vec![test_case("Suite.Long")],
        package: None,
        run_settings: None,
        test_execution_context: Default::default(),
        test_session_info: None,
    }
}

#[test]
fn cancel_stops_a_run_in_progress() -> Result<()> {
    let mut harness = Harness::start(FakeFactory::new(
        FakeDiscovery::finding_one_test(),
        FakeExecution::until_stopped(),
    ))?;
    harness.handshake(6)?;

    harness.send(MessageType::StartTestExecutionWithTests, &one_test_run())?;
    let execution = Arc::clone(&harness.factory.execution);
    harness.wait_until(|| execution.started_runs() == 1)?;

    let started = Instant::now();
    harness.handler.cancel();
    assert!(started.elapsed() < Duration::from_secs(2), "cancel took {:?}", started.elapsed());
    assert_eq!(*execution.aborts.lock().unwrap(), 1);

    harness.finished()?;
    assert_eq!(harness.handler.termination(), Some(Termination::Canceled));
    Ok(())
}

#[test]
fn cancel_releases_a_debugger_wait_held_by_a_run() -> Result<()> {
    let (result_tx, result_rx) = crossbeam_channel::bounded(1);
    let execution = FakeExecution::with(move |_, handler| {
        let launched = handler.launch_process_with_debugger_attached(TestProcessStartInfo {
            file_name: "/usr/bin/testhost".to_string(),
            ..Default::default()
        });
        let _ = result_tx.send(launched);
        handler.handle_test_run_complete(
            TestRunCompleteEventArgs::default(),
            None,
            Vec::new(),
            Vec::new(),
        );
        Ok(())
    });
    let options = HandlerOptions {
        debugger_attach_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let harness = Harness::start_with(
        FakeFactory::new(FakeDiscovery::finding_one_test(), execution),
        options,
        |h| h,
    )?;
    harness.handshake(6)?;

    harness.send(MessageType::StartTestExecutionWithTests, &one_test_run())?;
    harness.expect(MessageType::LaunchAdapterProcessWithDebuggerAttached)?;

    let started = Instant::now();
    harness.handler.cancel();
    assert!(started.elapsed() < Duration::from_secs(2), "cancel took {:?}", started.elapsed());
    assert_eq!(result_rx.recv_timeout(common::WAIT)?, Err(DebuggerError::Canceled));
    Ok(())
}

#[test]
fn unreadable_version_is_answered_with_the_base_version() -> Result<()> {
    let harness = Harness::start(FakeFactory::default())?;

    harness.send_raw(r#"{"MessageType":"VersionCheck","Payload":-1}"#)?;
    let ack = harness.expect(MessageType::VersionCheck)?;
    assert_eq!(ack.payload_as::<HandshakeAck>()?, HandshakeAck::Version(1));
    assert_eq!(harness.handler.protocol_version(), 1);
    assert_eq!(harness.handler.state(), SessionState::Ready);
    Ok(())
}

struct ReadOnlyDiagnostics;

impl Diagnostics for ReadOnlyDiagnostics {
    fn enable(&self) -> eyre::Result<()> {
        Err(eyre::eyre!("diagnostics directory is read-only"))
    }
}

#[test]
fn diagnostics_failure_is_reported_in_the_handshake() -> Result<()> {
    let harness = Harness::start_with(FakeFactory::default(), options_supporting(4), |handler| {
        handler.with_diagnostics(Arc::new(ReadOnlyDiagnostics))
    })?;

    let ack = harness.handshake(6)?.payload_as::<HandshakeAck>()?;
    match ack {
        HandshakeAck::WithDiagnosticsError {
            version,
            diagnostics_error,
        } => {
            assert_eq!(version, 4);
            assert!(diagnostics_error.contains("read-only"), "{diagnostics_error}");
        }
        other => eyre::bail!("expected a diagnostics error, got {other:?}"),
    }

    // the session carries on
    assert_eq!(harness.handler.state(), SessionState::Ready);
    Ok(())
}

#[test]
fn connection_wait_times_out() -> Result<()> {
    let connection = ConnectionInfo::new(transport::DEFAULT_ENDPOINT, ConnectionRole::Host);
    let handler = RequestHandler::new(&connection, HandlerOptions::default())?;
    let address = handler.initialize_communication()?;
    assert_ne!(address, transport::DEFAULT_ENDPOINT);

    let started = Instant::now();
    assert!(!handler.wait_for_request_sender_connection(Duration::from_millis(200)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(handler.state(), SessionState::CommunicationInitialized);

    handler.close();
    Ok(())
}

#[test]
fn cancel_releases_connection_wait() -> Result<()> {
    let connection = ConnectionInfo::new(transport::DEFAULT_ENDPOINT, ConnectionRole::Host);
    let handler = Arc::new(RequestHandler::new(&connection, HandlerOptions::default())?);
    handler.initialize_communication()?;

    let canceler = {
        let handler = Arc::clone(&handler);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            handler.cancel();
        })
    };

    let started = Instant::now();
    assert!(!handler.wait_for_request_sender_connection(Duration::from_secs(30)));
    assert!(started.elapsed() < Duration::from_secs(5));
    canceler.join().map_err(|_| eyre::eyre!("canceler panicked"))?;
    assert_eq!(handler.termination(), Some(Termination::Canceled));
    Ok(())
}
