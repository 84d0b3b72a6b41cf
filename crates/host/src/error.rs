use std::time::Duration;

/// Why a debugger launch or attach request did not produce a result
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DebuggerError {
    #[error("no debugger callback within {0:?}")]
    Timeout(Duration),

    #[error("debugger request canceled")]
    Canceled,

    /// The runner answered but could not launch or attach
    #[error("debugger request rejected: {0}")]
    Rejected(String),

    #[error("could not send debugger request: {0}")]
    Transport(String),
}
