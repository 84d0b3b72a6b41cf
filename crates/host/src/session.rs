use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use job_queue::{JobQueue, QueueError, QueueOptions};
use protocol::payloads::{
    AttachDebuggerAckPayload, AttachmentSet, DiscoveryCompleteEventArgs, DiscoveryCompletePayload,
    TestCase, TestMessageLevel, TestMessagePayload, TestProcessAttachDebuggerPayload,
    TestProcessStartInfo, TestRunChangedEventArgs, TestRunCompleteEventArgs,
    TestRunCompletePayload,
};
use protocol::{BASE_PROTOCOL_VERSION, MessageType};
use serde::Serialize;
use transport::Channel;

use crate::debugger::DebuggerCallbacks;
use crate::{DebuggerError, HandlerOptions, SessionState};

/// State shared between the request handler, the managers' event handlers
/// and the outgoing queue worker
pub(crate) struct Session {
    pub(crate) options: HandlerOptions,
    state: Mutex<SessionState>,
    version: AtomicU32,
    channel: Arc<Mutex<Option<Channel>>>,
    outgoing: JobQueue<String>,
    pub(crate) debugger: DebuggerCallbacks,
}

impl Session {
    pub(crate) fn new(options: HandlerOptions) -> eyre::Result<Self> {
        let channel: Arc<Mutex<Option<Channel>>> = Arc::default();

        let outgoing = {
            let channel = Arc::clone(&channel);
            JobQueue::with_error_callback(
                QueueOptions::named("outgoing")
                    .with_limits(options.max_queue_length, options.max_queue_size),
                move |text: String| {
                    let channel = lock(&channel)
                        .clone()
                        .ok_or_else(|| eyre::eyre!("no connection to send on"))?;
                    channel.send(&text)?;
                    Ok(())
                },
                |error| tracing::warn!(error = %error, "could not send message"),
            )?
        };

        Ok(Self {
            options,
            state: Mutex::new(SessionState::Created),
            version: AtomicU32::new(BASE_PROTOCOL_VERSION),
            channel,
            outgoing,
            debugger: DebuggerCallbacks::default(),
        })
    }

    pub(crate) fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub(crate) fn advance(&self, next: SessionState) -> bool {
        lock(&self.state).advance(next)
    }

    /// Move back to `Ready` if `from` is the current state
    pub(crate) fn finish(&self, from: SessionState) {
        let mut state = lock(&self.state);
        if *state == from {
            state.advance(SessionState::Ready);
        }
    }

    pub(crate) fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    pub(crate) fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::SeqCst);
    }

    pub(crate) fn attach_channel(&self, channel: Channel) {
        *lock(&self.channel) = Some(channel);
    }

    pub(crate) fn channel(&self) -> Option<Channel> {
        lock(&self.channel).clone()
    }

    pub(crate) fn outgoing(&self) -> &JobQueue<String> {
        &self.outgoing
    }

    /// Queue a message stamped with the negotiated protocol version
    pub(crate) fn send<T>(&self, message_type: MessageType, payload: &T) -> Result<(), QueueError>
    where
        T: Serialize + ?Sized,
    {
        match protocol::serialize_versioned_payload(message_type.clone(), payload, self.version()) {
            Ok(text) => self.enqueue(message_type, text),
            Err(e) => {
                tracing::error!(%message_type, error = %e, "could not serialize message");
                Ok(())
            }
        }
    }

    pub(crate) fn enqueue(&self, message_type: MessageType, text: String) -> Result<(), QueueError> {
        tracing::trace!(%message_type, length = text.len(), "queueing message");
        let size = text.len();
        self.outgoing.enqueue(text, size).inspect_err(|e| {
            tracing::debug!(%message_type, error = %e, "message not queued");
        })
    }

    pub(crate) fn send_log(&self, level: TestMessageLevel, message: &str) {
        let payload = TestMessagePayload {
            message_level: level,
            message: message.to_string(),
        };
        let _ = self.send(MessageType::TestMessage, &payload);
    }

    pub(crate) fn send_discovered_tests(&self, tests: &[TestCase]) {
        tracing::debug!(count = tests.len(), "sending discovered tests");
        let _ = self.send(MessageType::DiscoveredTests, tests);
    }

    pub(crate) fn discovery_complete(
        &self,
        args: DiscoveryCompleteEventArgs,
        last_chunk: Vec<TestCase>,
    ) {
        tracing::info!(total = args.total_count, aborted = args.is_aborted, "discovery complete");
        let payload = DiscoveryCompletePayload {
            total_tests: args.total_count,
            last_discovered_tests: last_chunk,
            is_aborted: args.is_aborted,
            metrics: args.metrics,
        };
        let _ = self.send(MessageType::DiscoveryComplete, &payload);
        self.finish(SessionState::Discovering);
    }

    pub(crate) fn send_test_run_statistics(&self, args: &TestRunChangedEventArgs) {
        let _ = self.send(MessageType::TestRunStatsChange, args);
    }

    pub(crate) fn send_execution_complete(
        &self,
        args: TestRunCompleteEventArgs,
        last_chunk: Option<TestRunChangedEventArgs>,
        run_attachments: Vec<AttachmentSet>,
        executor_uris: Vec<String>,
    ) {
        tracing::info!(
            canceled = args.is_canceled,
            aborted = args.is_aborted,
            "execution complete"
        );
        let payload = TestRunCompletePayload {
            test_run_complete_args: args,
            last_run_tests: last_chunk,
            run_attachments,
            executor_uris,
        };
        let _ = self.send(MessageType::ExecutionComplete, &payload);
        self.finish(SessionState::Executing);
    }

    #[tracing::instrument(skip(self, start_info), fields(file_name = %start_info.file_name))]
    pub(crate) fn launch_process_with_debugger_attached(
        &self,
        start_info: TestProcessStartInfo,
    ) -> Result<i32, DebuggerError> {
        self.debugger
            .launch(self.options.debugger_attach_timeout, || {
                self.send(MessageType::LaunchAdapterProcessWithDebuggerAttached, &start_info)
                    .map_err(|e| DebuggerError::Transport(e.to_string()))
            })
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn attach_debugger_to_process(&self, process_id: i32) -> Result<bool, DebuggerError> {
        let payload = TestProcessAttachDebuggerPayload {
            process_id,
            target_framework: None,
        };
        self.debugger
            .attach(self.options.debugger_attach_timeout, || {
                self.send(MessageType::AttachDebugger, &payload)
                    .map_err(|e| DebuggerError::Transport(e.to_string()))
            })
    }

    /// Deliver a `LaunchAdapterProcessWithDebuggerAttachedCallback` payload
    pub(crate) fn complete_launch(&self, process_id: i32) {
        let result = if process_id > 0 {
            Ok(process_id)
        } else {
            Err(DebuggerError::Rejected(format!(
                "runner could not launch the process (reported id {process_id})"
            )))
        };
        if !self.debugger.complete_launch(result) {
            tracing::warn!(process_id, "launch callback without a pending request");
        }
    }

    /// Deliver an `AttachDebuggerCallback` payload
    pub(crate) fn complete_attach(&self, ack: AttachDebuggerAckPayload) {
        if let Some(error) = ack.error_message.as_deref().filter(|_| !ack.attached) {
            tracing::warn!(%error, "runner could not attach debugger");
        }
        if !self.debugger.complete_attach(Ok(ack.attached)) {
            tracing::warn!("attach callback without a pending request");
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
