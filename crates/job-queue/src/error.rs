use std::io;
use std::time::Duration;

/// Errors returned by a [`crate::JobQueue`]
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue was disposed; the job was not accepted or the flush could
    /// not complete.
    #[error("job queue closed")]
    Closed,

    #[error("job queue did not drain within {0:?}")]
    FlushTimeout(Duration),

    #[error("spawning worker thread: {0}")]
    Spawn(#[source] io::Error),
}
