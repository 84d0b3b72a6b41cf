//! Messages survive serialization and framing unchanged.

use bytes::BytesMut;
use protocol::payloads::{
    AttachmentSet, DiscoveryCompletePayload, DiscoveryCriteria, TestCase, TestOutcome, TestResult,
    TestRunChangedEventArgs, TestRunCompleteEventArgs, TestRunCompletePayload, TestRunStatistics,
    UriDataAttachment,
};
use protocol::{FrameCodec, Message, MessageType, deserialize_message};

fn through_the_wire(messages: &[Message]) -> eyre::Result<Vec<Message>> {
    let mut codec = FrameCodec::new();
    let mut wire = BytesMut::new();
    for message in messages {
        codec.encode(&message.to_frame_text()?, &mut wire)?;
    }

    let mut received = Vec::new();
    while let Some(text) = codec.decode(&mut wire)? {
        received.push(deserialize_message(&text)?);
    }
    Ok(received)
}

#[test]
fn representative_messages_round_trip() -> eyre::Result<()> {
    let case = TestCase::new("Sample.Tests.Adds", "executor://sample/v1", "sample.dll");
    let result = TestResult::new(case.clone(), TestOutcome::Passed);
    let run_complete = TestRunCompletePayload {
        test_run_complete_args: TestRunCompleteEventArgs {
            test_run_statistics: Some(TestRunStatistics::from_results([&result])),
            is_canceled: false,
            is_aborted: false,
            error: None,
            attachment_sets: Vec::new(),
            elapsed_time_ms: 12,
        },
        last_run_tests: Some(TestRunChangedEventArgs {
            new_test_results: vec![result.clone()],
            test_run_statistics: None,
            active_tests: Vec::new(),
        }),
        run_attachments: vec![AttachmentSet {
            uri: "datacollector://coverage".to_string(),
            display_name: "Code Coverage".to_string(),
            attachments: vec![UriDataAttachment {
                uri: "file:///tmp/run.coverage".to_string(),
                description: None,
            }],
        }],
        executor_uris: vec!["executor://sample/v1".to_string()],
    };

    let messages = vec![
        Message::with_payload(MessageType::VersionCheck, &3)?,
        Message::with_payload(
            MessageType::StartDiscovery,
            &DiscoveryCriteria::for_sources(["sample.dll"]),
        )?
        .versioned(3),
        Message::with_payload(MessageType::DiscoveredTests, &vec![case.clone()])?.versioned(3),
        Message::with_payload(
            MessageType::DiscoveryComplete,
            &DiscoveryCompletePayload {
                total_tests: 1,
                last_discovered_tests: Vec::new(),
                is_aborted: false,
                metrics: None,
            },
        )?
        .versioned(3),
        Message::with_payload(MessageType::ExecutionComplete, &run_complete)?.versioned(3),
        Message::with_payload(MessageType::Unknown("Future.Thing".to_string()), &"data")?,
        Message::new(MessageType::SessionEnd),
    ];

    let received = through_the_wire(&messages)?;
    assert_eq!(received, messages);

    let decoded: TestRunCompletePayload = received[4].payload_as()?;
    assert_eq!(decoded, run_complete);
    Ok(())
}
