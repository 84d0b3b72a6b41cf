use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

/// Polls a process and runs a callback once it has gone away.
///
/// The test host uses this to exit when the runner that launched it dies
/// without ending the session. Dropping the watchdog stops it.
pub struct ParentWatchdog {
    pid: u32,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ParentWatchdog {
    /// Start polling `pid` every `interval` using the system liveness probe
    pub fn spawn<F>(pid: u32, interval: Duration, on_exit: F) -> std::io::Result<Self>
    where
        F: FnOnce(u32) + Send + 'static,
    {
        Self::with_probe(pid, interval, crate::is_process_alive, on_exit)
    }

    /// Like [`ParentWatchdog::spawn`] with a custom liveness probe
    pub fn with_probe<P, F>(
        pid: u32,
        interval: Duration,
        probe: P,
        on_exit: F,
    ) -> std::io::Result<Self>
    where
        P: Fn(u32) -> bool + Send + 'static,
        F: FnOnce(u32) + Send + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("parent-watchdog".to_string())
            .spawn(move || {
                tracing::debug!(pid, ?interval, "watching parent process");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if !probe(pid) {
                                tracing::warn!(pid, "parent process exited");
                                on_exit(pid);
                                return;
                            }
                        }
                        // stopped or dropped
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })?;

        Ok(Self {
            pid,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for ParentWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn fires_when_probe_reports_exit() {
        let alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = crossbeam_channel::bounded(1);

        let _watchdog = {
            let alive = Arc::clone(&alive);
            ParentWatchdog::with_probe(
                4242,
                Duration::from_millis(10),
                move |_| alive.load(Ordering::SeqCst),
                move |pid| {
                    let _ = tx.send(pid);
                },
            )
            .unwrap()
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        alive.store(false, Ordering::SeqCst);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 4242);
    }

    #[test]
    fn stopped_watchdog_never_fires() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let watchdog = ParentWatchdog::with_probe(
            1,
            Duration::from_millis(50),
            |_| false,
            move |pid| {
                let _ = tx.send(pid);
            },
        )
        .unwrap();

        watchdog.stop();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
