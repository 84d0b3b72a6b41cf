//! Message envelope and serializer.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{BASE_PROTOCOL_VERSION, ProtocolError, Result};

/// Type tag of a protocol message.
///
/// The set is closed for this implementation but open on the wire: a tag we
/// do not know deserializes to [`MessageType::Unknown`] so that a newer peer
/// can talk to an older one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
#[non_exhaustive]
pub enum MessageType {
    VersionCheck,
    DiscoveryInitialize,
    StartDiscovery,
    DiscoveredTests,
    DiscoveryComplete,
    ExecutionInitialize,
    StartTestExecutionWithSources,
    StartTestExecutionWithTests,
    TestRunStatsChange,
    CancelTestRun,
    AbortTestRun,
    ExecutionComplete,
    TestMessage,
    LaunchAdapterProcessWithDebuggerAttached,
    LaunchAdapterProcessWithDebuggerAttachedCallback,
    AttachDebugger,
    AttachDebuggerCallback,
    SessionEnd,
    SessionAbort,
    /// Catch-all for tags this implementation does not understand
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::VersionCheck => "VersionCheck",
            MessageType::DiscoveryInitialize => "DiscoveryInitialize",
            MessageType::StartDiscovery => "StartDiscovery",
            MessageType::DiscoveredTests => "DiscoveredTests",
            MessageType::DiscoveryComplete => "DiscoveryComplete",
            MessageType::ExecutionInitialize => "ExecutionInitialize",
            MessageType::StartTestExecutionWithSources => "StartTestExecutionWithSources",
            MessageType::StartTestExecutionWithTests => "StartTestExecutionWithTests",
            MessageType::TestRunStatsChange => "TestRunStatsChange",
            MessageType::CancelTestRun => "CancelTestRun",
            MessageType::AbortTestRun => "AbortTestRun",
            MessageType::ExecutionComplete => "ExecutionComplete",
            MessageType::TestMessage => "TestMessage",
            MessageType::LaunchAdapterProcessWithDebuggerAttached => {
                "LaunchAdapterProcessWithDebuggerAttached"
            }
            MessageType::LaunchAdapterProcessWithDebuggerAttachedCallback => {
                "LaunchAdapterProcessWithDebuggerAttachedCallback"
            }
            MessageType::AttachDebugger => "AttachDebugger",
            MessageType::AttachDebuggerCallback => "AttachDebuggerCallback",
            MessageType::SessionEnd => "SessionEnd",
            MessageType::SessionAbort => "SessionAbort",
            MessageType::Unknown(other) => other,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "VersionCheck" => MessageType::VersionCheck,
            "DiscoveryInitialize" => MessageType::DiscoveryInitialize,
            "StartDiscovery" => MessageType::StartDiscovery,
            "DiscoveredTests" => MessageType::DiscoveredTests,
            "DiscoveryComplete" => MessageType::DiscoveryComplete,
            "ExecutionInitialize" => MessageType::ExecutionInitialize,
            "StartTestExecutionWithSources" => MessageType::StartTestExecutionWithSources,
            "StartTestExecutionWithTests" => MessageType::StartTestExecutionWithTests,
            "TestRunStatsChange" => MessageType::TestRunStatsChange,
            "CancelTestRun" => MessageType::CancelTestRun,
            "AbortTestRun" => MessageType::AbortTestRun,
            "ExecutionComplete" => MessageType::ExecutionComplete,
            "TestMessage" => MessageType::TestMessage,
            "LaunchAdapterProcessWithDebuggerAttached" => {
                MessageType::LaunchAdapterProcessWithDebuggerAttached
            }
            "LaunchAdapterProcessWithDebuggerAttachedCallback" => {
                MessageType::LaunchAdapterProcessWithDebuggerAttachedCallback
            }
            "AttachDebugger" => MessageType::AttachDebugger,
            "AttachDebuggerCallback" => MessageType::AttachDebuggerCallback,
            "SessionEnd" => MessageType::SessionEnd,
            "SessionAbort" => MessageType::SessionAbort,
            _ => MessageType::Unknown(value),
        }
    }
}

impl From<&str> for MessageType {
    fn from(value: &str) -> Self {
        MessageType::from(value.to_string())
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Unknown(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message.
///
/// Serialized as `{"MessageType": ..., "Version": ..., "Payload": ...}`. The
/// version is omitted for protocol version 1 and for messages sent before the
/// handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    /// A message without a payload
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            version: None,
            payload: Value::Null,
        }
    }

    /// Build a message carrying `payload`
    pub fn with_payload<T>(message_type: MessageType, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload).map_err(ProtocolError::Serialize)?;
        Ok(Self {
            message_type,
            version: None,
            payload,
        })
    }

    /// Stamp the negotiated protocol version on this message.
    ///
    /// Version 1 is the implicit default and is never written out.
    pub fn versioned(mut self, version: u32) -> Self {
        self.version = (version > BASE_PROTOCOL_VERSION).then_some(version);
        self
    }

    /// Convert the payload into a concrete type
    pub fn payload_as<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        T::deserialize(&self.payload).map_err(|source| ProtocolError::PayloadTypeMismatch {
            message_type: self.message_type.to_string(),
            source,
        })
    }

    /// Serialize this message into the text carried by one frame
    pub fn to_frame_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(ProtocolError::Serialize)
    }
}

/// Serialize a message that carries no payload
pub fn serialize_message(message_type: MessageType) -> Result<String> {
    Message::new(message_type).to_frame_text()
}

/// Serialize `payload` as a message of the given type
pub fn serialize_payload<T>(message_type: MessageType, payload: &T) -> Result<String>
where
    T: Serialize + ?Sized,
{
    Message::with_payload(message_type, payload)?.to_frame_text()
}

/// Serialize `payload` stamped with the negotiated protocol `version`
pub fn serialize_versioned_payload<T>(
    message_type: MessageType,
    payload: &T,
    version: u32,
) -> Result<String>
where
    T: Serialize + ?Sized,
{
    Message::with_payload(message_type, payload)?
        .versioned(version)
        .to_frame_text()
}

/// Parse the text of one frame into a [`Message`]
pub fn deserialize_message(raw: &str) -> Result<Message> {
    serde_json::from_str(raw).map_err(ProtocolError::MalformedMessage)
}

/// Convert the payload of `message` into `T`
pub fn deserialize_payload<T>(message: &Message) -> Result<T>
where
    T: DeserializeOwned,
{
    message.payload_as()
}
