//! Ordered background job queue with producer backpressure
//!
//! Jobs are handed to a single worker thread and processed strictly in the
//! order they were enqueued. A bounded queue blocks producers while the work
//! waiting to be processed exceeds its configured length or size, so a slow
//! consumer cannot make the queue grow without limit.
//!
//! ```
//! use job_queue::{JobQueue, QueueOptions};
//!
//! let (tx, rx) = std::sync::mpsc::channel();
//! let queue = JobQueue::new(QueueOptions::named("example"), move |job: u32| {
//!     tx.send(job * 2)?;
//!     Ok(())
//! })?;
//!
//! queue.enqueue(1, 1)?;
//! queue.enqueue(2, 1)?;
//! queue.flush()?;
//! assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![2, 4]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

mod error;

pub use error::QueueError;

/// Default limit on the number of queued jobs
pub const DEFAULT_MAX_LENGTH: usize = 500;

/// Default limit on the summed size of queued jobs
pub const DEFAULT_MAX_SIZE: usize = 25_000_000;

/// Limits applied to a [`JobQueue`]
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Used for the worker thread name and in log messages
    pub name: String,
    pub max_length: usize,
    pub max_size: usize,
    /// Unbounded queues never block producers
    pub bounded: bool,
}

impl QueueOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_length: DEFAULT_MAX_LENGTH,
            max_size: DEFAULT_MAX_SIZE,
            bounded: true,
        }
    }

    pub fn with_limits(mut self, max_length: usize, max_size: usize) -> Self {
        self.max_length = max_length;
        self.max_size = max_size;
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.bounded = false;
        self
    }
}

type Processor<T> = Box<dyn FnMut(T) -> eyre::Result<()> + Send>;
type ErrorCallback = Box<dyn Fn(eyre::Report) + Send>;

enum Entry<T> {
    Job { job: T, size: usize },
    // completes once every entry ahead of it has been processed
    Barrier(oneshot::Sender<()>),
}

struct State<T> {
    entries: VecDeque<Entry<T>>,
    // jobs queued or being processed
    pending_length: usize,
    pending_size: usize,
    paused: bool,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    job_available: Condvar,
    space_available: Condvar,
    options: QueueOptions,
}

/// Handle to a queue and its worker thread.
///
/// Dropping the handle disposes the queue. Share it behind an `Arc` to
/// enqueue from several threads.
pub struct JobQueue<T> {
    shared: Arc<Shared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T> JobQueue<T>
where
    T: Send + 'static,
{
    /// Create a queue whose worker passes each job to `processor`.
    ///
    /// Errors and panics raised by `processor` are logged and the worker moves
    /// on to the next job.
    pub fn new<F>(options: QueueOptions, processor: F) -> Result<Self, QueueError>
    where
        F: FnMut(T) -> eyre::Result<()> + Send + 'static,
    {
        let name = options.name.clone();
        Self::with_error_callback(options, processor, move |error| {
            tracing::error!(queue = %name, error = %error, "job failed");
        })
    }

    /// Like [`JobQueue::new`], reporting failed jobs to `on_error`
    pub fn with_error_callback<F, E>(
        options: QueueOptions,
        processor: F,
        on_error: E,
    ) -> Result<Self, QueueError>
    where
        F: FnMut(T) -> eyre::Result<()> + Send + 'static,
        E: Fn(eyre::Report) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                pending_length: 0,
                pending_size: 0,
                paused: false,
                closed: false,
            }),
            job_available: Condvar::new(),
            space_available: Condvar::new(),
            options,
        });

        let worker = {
            let shared = Arc::clone(&shared);
            let processor: Processor<T> = Box::new(processor);
            let on_error: ErrorCallback = Box::new(on_error);
            thread::Builder::new()
                .name(format!("job-queue-{}", shared.options.name))
                .spawn(move || work(&shared, processor, on_error))
                .map_err(QueueError::Spawn)?
        };

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.options.name
    }

    /// Append `job` to the queue, blocking while a bounded queue is over its
    /// limits.
    ///
    /// `size` is the caller's estimate of the job's cost, e.g. the length of
    /// the message it sends. A job is always admitted into an empty queue, so
    /// a single job larger than the size limit cannot block forever.
    pub fn enqueue(&self, job: T, size: usize) -> Result<(), QueueError> {
        let mut state = lock(&self.shared.state);
        let mut blocked = false;
        loop {
            if state.closed {
                return Err(QueueError::Closed);
            }
            if !self.must_wait(&state, size) {
                break;
            }
            if !blocked {
                tracing::debug!(
                    queue = %self.shared.options.name,
                    pending_length = state.pending_length,
                    pending_size = state.pending_size,
                    "queue full, blocking producer"
                );
                blocked = true;
            }
            state = self
                .shared
                .space_available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        state.entries.push_back(Entry::Job { job, size });
        state.pending_length += 1;
        state.pending_size += size;
        self.shared.job_available.notify_one();
        Ok(())
    }

    fn must_wait(&self, state: &State<T>, size: usize) -> bool {
        let options = &self.shared.options;
        options.bounded
            && state.pending_length > 0
            && (state.pending_length >= options.max_length
                || state.pending_size + size > options.max_size)
    }

    /// Block until every job enqueued before this call has been processed
    pub fn flush(&self) -> Result<(), QueueError> {
        let done = self.push_barrier()?;
        done.recv().map_err(|_| QueueError::Closed)
    }

    /// Like [`JobQueue::flush`], giving up after `timeout`
    pub fn flush_with_timeout(&self, timeout: Duration) -> Result<(), QueueError> {
        let done = self.push_barrier()?;
        match done.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(oneshot::RecvTimeoutError::Timeout) => Err(QueueError::FlushTimeout(timeout)),
            Err(oneshot::RecvTimeoutError::Disconnected) => Err(QueueError::Closed),
        }
    }

    fn push_barrier(&self) -> Result<oneshot::Receiver<()>, QueueError> {
        let (tx, rx) = oneshot::channel();
        let mut state = lock(&self.shared.state);
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.entries.push_back(Entry::Barrier(tx));
        self.shared.job_available.notify_one();
        Ok(rx)
    }

    /// Stop taking jobs off the queue. The job in progress still completes.
    pub fn pause(&self) {
        lock(&self.shared.state).paused = true;
    }

    pub fn resume(&self) {
        lock(&self.shared.state).paused = false;
        self.shared.job_available.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.shared.state).paused
    }

    /// Number of jobs queued or in progress
    pub fn len(&self) -> usize {
        lock(&self.shared.state).pending_length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the worker once the job in progress completes.
    ///
    /// Jobs still queued are discarded, blocked producers and pending flushes
    /// return [`QueueError::Closed`]. Calling this more than once is harmless.
    pub fn dispose(&self) {
        let discarded = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                0
            } else {
                state.closed = true;
                let discarded = state
                    .entries
                    .drain(..)
                    .filter(|entry| matches!(entry, Entry::Job { .. }))
                    .count();
                self.shared.job_available.notify_all();
                self.shared.space_available.notify_all();
                discarded
            }
        };
        if discarded > 0 {
            tracing::debug!(queue = %self.shared.options.name, discarded, "disposing non-empty queue");
        }

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            // disposing from inside a job must not join the worker itself
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::warn!(queue = %self.shared.options.name, "worker thread panicked");
            }
        }
    }
}

impl<T> Drop for JobQueue<T> {
    fn drop(&mut self) {
        {
            let mut state = lock(&self.shared.state);
            state.closed = true;
            state.entries.clear();
        }
        self.shared.job_available.notify_all();
        self.shared.space_available.notify_all();
        if let Some(worker) = lock(&self.worker).take()
            && worker.thread().id() != thread::current().id()
        {
            let _ = worker.join();
        }
    }
}

fn work<T>(shared: &Shared<T>, mut processor: Processor<T>, on_error: ErrorCallback) {
    let name = &shared.options.name;
    tracing::trace!(queue = %name, "worker started");
    loop {
        let entry = {
            let mut state = lock(&shared.state);
            loop {
                if state.closed {
                    tracing::trace!(queue = %name, "worker finished");
                    return;
                }
                if !state.paused
                    && let Some(entry) = state.entries.pop_front()
                {
                    break entry;
                }
                state = shared
                    .job_available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        match entry {
            Entry::Barrier(done) => {
                let _ = done.send(());
            }
            Entry::Job { job, size } => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor(job)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => on_error(error),
                    Err(payload) => on_error(eyre::eyre!(
                        "job panicked: {}",
                        panic_message(payload.as_ref())
                    )),
                }

                let mut state = lock(&shared.state);
                state.pending_length = state.pending_length.saturating_sub(1);
                state.pending_size = state.pending_size.saturating_sub(size);
                shared.space_available.notify_all();
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
