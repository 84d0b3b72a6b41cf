//! Process level helpers shared by the test host and the runner
use std::time::Duration;

mod arch;
pub mod launcher;
mod watchdog;

pub use arch::Architecture;
pub use launcher::{HostOptions, TestHostProcess};
pub use watchdog::ParentWatchdog;

/// Whether a process with this id currently exists
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // exists, owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    tracing::trace!(pid, "liveness probe not supported on this platform");
    true
}

/// Questions the test host asks about processes
pub trait ProcessHelper: Send + Sync {
    fn current_process_id(&self) -> u32;

    fn current_process_architecture(&self) -> Architecture;

    fn process_architecture(&self, pid: u32) -> eyre::Result<Architecture>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Call `callback` once process `pid` has exited.
    ///
    /// Watching stops when the returned watchdog is dropped.
    fn set_exit_callback(
        &self,
        pid: u32,
        callback: Box<dyn FnOnce(u32) + Send>,
    ) -> eyre::Result<ParentWatchdog>;
}

/// [`ProcessHelper`] backed by the operating system
#[derive(Debug, Clone)]
pub struct SystemProcessHelper {
    poll_interval: Duration,
}

impl SystemProcessHelper {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for SystemProcessHelper {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ProcessHelper for SystemProcessHelper {
    fn current_process_id(&self) -> u32 {
        std::process::id()
    }

    fn current_process_architecture(&self) -> Architecture {
        Architecture::current()
    }

    fn process_architecture(&self, pid: u32) -> eyre::Result<Architecture> {
        if pid == std::process::id() {
            return Ok(Architecture::current());
        }
        if cfg!(target_os = "linux") {
            Architecture::of_executable(format!("/proc/{pid}/exe"))
        } else {
            eyre::bail!("cannot determine the architecture of process {pid} on this platform")
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }

    fn set_exit_callback(
        &self,
        pid: u32,
        callback: Box<dyn FnOnce(u32) + Send>,
    ) -> eyre::Result<ParentWatchdog> {
        let watchdog = ParentWatchdog::spawn(pid, self.poll_interval, callback)?;
        Ok(watchdog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        let helper = SystemProcessHelper::default();
        assert!(helper.is_alive(helper.current_process_id()));
    }

    #[cfg(unix)]
    #[test]
    fn reaped_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn own_architecture() {
        let helper = SystemProcessHelper::default();
        assert_eq!(
            helper
                .process_architecture(helper.current_process_id())
                .unwrap(),
            Architecture::current()
        );
    }
}
