//! Correlating debugger requests with the runner's callbacks
//!
//! A debugger request is sent as a message and answered later by a callback
//! message that the request processing thread receives. Only one request is
//! in flight at a time: later callers queue on the gate until the current one
//! has its answer, timed out, or was canceled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::DebuggerError;

type Slot<T> = Mutex<Option<oneshot::Sender<Result<T, DebuggerError>>>>;

#[derive(Default)]
pub(crate) struct DebuggerCallbacks {
    gate: Mutex<()>,
    launch: Slot<i32>,
    attach: Slot<bool>,
    canceled: AtomicBool,
}

impl DebuggerCallbacks {
    pub(crate) fn launch<F>(&self, timeout: Duration, send: F) -> Result<i32, DebuggerError>
    where
        F: FnOnce() -> Result<(), DebuggerError>,
    {
        self.request(&self.launch, timeout, send)
    }

    pub(crate) fn attach<F>(&self, timeout: Duration, send: F) -> Result<bool, DebuggerError>
    where
        F: FnOnce() -> Result<(), DebuggerError>,
    {
        self.request(&self.attach, timeout, send)
    }

    /// Hand the runner's answer to the waiting launch request.
    ///
    /// Returns false when nothing was waiting, e.g. the request already timed out.
    pub(crate) fn complete_launch(&self, result: Result<i32, DebuggerError>) -> bool {
        complete(&self.launch, result)
    }

    pub(crate) fn complete_attach(&self, result: Result<bool, DebuggerError>) -> bool {
        complete(&self.attach, result)
    }

    /// Release the waiting request, and refuse any later ones
    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        // dropping the senders wakes the waiter with a disconnect
        lock(&self.launch).take();
        lock(&self.attach).take();
    }

    fn request<T, F>(&self, slot: &Slot<T>, timeout: Duration, send: F) -> Result<T, DebuggerError>
    where
        F: FnOnce() -> Result<(), DebuggerError>,
    {
        let _gate = lock(&self.gate);
        if self.canceled.load(Ordering::SeqCst) {
            return Err(DebuggerError::Canceled);
        }

        let (tx, rx) = oneshot::channel();
        *lock(slot) = Some(tx);

        // cancel() sets the flag before emptying the slots, so either it saw
        // our sender or we see the flag here
        if self.canceled.load(Ordering::SeqCst) {
            lock(slot).take();
            return Err(DebuggerError::Canceled);
        }

        if let Err(e) = send() {
            lock(slot).take();
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(oneshot::RecvTimeoutError::Timeout) => {
                lock(slot).take();
                tracing::warn!(?timeout, "no debugger callback received");
                Err(DebuggerError::Timeout(timeout))
            }
            Err(oneshot::RecvTimeoutError::Disconnected) => Err(DebuggerError::Canceled),
        }
    }
}

fn complete<T>(slot: &Slot<T>, result: Result<T, DebuggerError>) -> bool {
    match lock(slot).take() {
        Some(tx) => {
            let _ = tx.send(result);
            true
        }
        None => false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
