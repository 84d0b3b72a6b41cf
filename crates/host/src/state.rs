use std::fmt;

/// Lifecycle of a test host session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    /// The endpoint is listening or dialing
    CommunicationInitialized,
    /// Connected, waiting for `VersionCheck`
    AwaitingHandshake,
    Ready,
    Discovering,
    Executing,
    /// `SessionEnd` was processed
    Ended,
    /// The session was canceled locally
    Canceled,
    /// The connection failed or the peer went away
    Aborted,
}

/// How a session finished, used by the binary to pick its exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Clean,
    Abnormal,
    Canceled,
}

impl Termination {
    pub fn exit_code(self) -> i32 {
        match self {
            Termination::Clean => 0,
            Termination::Abnormal => 1,
            Termination::Canceled => 2,
        }
    }
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Ended | SessionState::Canceled | SessionState::Aborted
        )
    }

    /// Whether requests from the runner are being processed
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Ready | SessionState::Discovering | SessionState::Executing
        )
    }

    pub fn termination(self) -> Option<Termination> {
        match self {
            SessionState::Ended => Some(Termination::Clean),
            SessionState::Canceled => Some(Termination::Canceled),
            SessionState::Aborted => Some(Termination::Abnormal),
            _ => None,
        }
    }

    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        match (self, next) {
            (Created, CommunicationInitialized) => true,
            (CommunicationInitialized, AwaitingHandshake) => true,
            (AwaitingHandshake, Ready) => true,
            // operations are queued, so a new one may be requested before the
            // previous one has reported completion
            (Ready | Discovering | Executing, Ready | Discovering | Executing) => true,
            _ => false,
        }
    }

    /// Move to `next` if that is a legal transition.
    ///
    /// Terminal states are never left. Returns whether the state changed.
    pub(crate) fn advance(&mut self, next: SessionState) -> bool {
        if *self == next {
            return false;
        }
        if !self.can_become(next) {
            tracing::debug!(from = %self, to = %next, "ignoring session state transition");
            return false;
        }
        tracing::trace!(from = %self, to = %next, "session state transition");
        *self = next;
        true
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
