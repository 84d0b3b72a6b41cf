//! Starting a test host process from the runner
use std::{
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crossbeam_channel::RecvTimeoutError;
use eyre::WrapErr;

/// Prefix of the line a listening test host prints once it accepts connections
pub const READY_MARKER: &str = "testhost listening on ";

/// Default timeout for waiting for a test host to become ready
pub const HOST_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// How to launch a test host
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub program: PathBuf,
    pub endpoint: String,
    /// `client` when the runner listens, `host` when the test host listens
    pub role: String,
    pub parent_process_id: Option<u32>,
    pub diagnostics: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub ready_timeout: Duration,
}

impl HostOptions {
    pub fn new(program: impl Into<PathBuf>, endpoint: impl Into<String>, role: &str) -> Self {
        Self {
            program: program.into(),
            endpoint: endpoint.into(),
            role: role.to_string(),
            parent_process_id: Some(std::process::id()),
            diagnostics: None,
            extra_args: Vec::new(),
            ready_timeout: HOST_READY_TIMEOUT,
        }
    }

    fn listens(&self) -> bool {
        self.role.eq_ignore_ascii_case("host")
    }

    /// The command that starts the test host
    pub fn command(&self) -> eyre::Result<Command> {
        let program = resolve_program(&self.program)?;
        let mut command = Command::new(program);
        command
            .args(["--endpoint", &self.endpoint])
            .args(["--role", &self.role]);
        if let Some(pid) = self.parent_process_id {
            command.args(["--parentprocessid", &pid.to_string()]);
        }
        if let Some(diagnostics) = &self.diagnostics {
            command.arg("--diag").arg(diagnostics);
        }
        command.args(&self.extra_args);
        Ok(command)
    }
}

// bare names are looked up on PATH, anything else is used as given
fn resolve_program(program: &Path) -> eyre::Result<PathBuf> {
    if program.components().count() > 1 {
        return Ok(program.to_path_buf());
    }
    which::which(program)
        .map_err(|_| eyre::eyre!("{} not found in PATH", program.display()))
}

/// A running test host, killed when dropped
pub struct TestHostProcess {
    child: Child,
    address: Option<String>,
}

impl TestHostProcess {
    /// Start the test host.
    ///
    /// A listening test host announces its address on stdout; this waits for
    /// that line, so [`TestHostProcess::address`] is ready to dial on return.
    #[tracing::instrument(skip(options), fields(program = %options.program.display()))]
    pub fn spawn(options: &HostOptions) -> eyre::Result<Self> {
        tracing::debug!(endpoint = %options.endpoint, role = %options.role, "starting test host");

        let mut child = options
            .command()?
            .stdout(Stdio::piped())
            .spawn()
            .context("spawning test host process")?;

        let address = if options.listens() {
            tracing::debug!("waiting until test host is ready");
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| eyre::eyre!("test host stdout was not captured"))?;
            let line = wait_for_ready(stdout, READY_MARKER, options.ready_timeout, &mut child)
                .context("waiting for test host readiness")?;
            let address = line
                .split_once(READY_MARKER)
                .map(|(_, address)| address.trim().to_string())
                .unwrap_or_default();
            tracing::debug!(%address, "test host ready");
            Some(address)
        } else {
            None
        };

        Ok(Self { child, address })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Address a listening test host accepts connections on
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn try_wait(&mut self) -> eyre::Result<Option<ExitStatus>> {
        self.child.try_wait().context("checking test host status")
    }

    /// Wait up to `timeout` for the test host to exit on its own
    pub fn wait_timeout(&mut self, timeout: Duration) -> eyre::Result<Option<ExitStatus>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if std::time::Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for TestHostProcess {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        tracing::debug!("terminating test host");
        match self.child.kill() {
            Ok(_) => {
                tracing::debug!("test host terminated");
                let _ = self.child.wait();
            }
            Err(e) => tracing::warn!(error = %e, "could not terminate test host process"),
        }
    }
}

/// Wait for a process to output a line containing `needle` and return it.
///
/// Lines are read on a background thread. Fails if the timeout is exceeded
/// or the output ends first; the error includes everything the process wrote.
pub fn wait_for_ready(
    reader: impl Read + Send + 'static,
    needle: &str,
    timeout: Duration,
    child: &mut Child,
) -> eyre::Result<String> {
    let needle_owned = needle.to_string();
    let (tx, rx) = crossbeam_channel::bounded(1);

    let collected_output = Arc::new(Mutex::new(Vec::<String>::new()));
    let collected_output_writer = Arc::clone(&collected_output);

    thread::spawn(move || {
        let reader = BufReader::new(reader);
        let mut should_signal = true;
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if should_signal && line.contains(&needle_owned) {
                should_signal = false;
                let _ = tx.send(line.clone());
            }
            if let Ok(mut output) = collected_output_writer.lock() {
                output.push(line);
            }
        }
    });

    let collected = || {
        collected_output
            .lock()
            .map(|o| o.join("\n"))
            .unwrap_or_default()
    };

    match rx.recv_timeout(timeout) {
        Ok(line) => Ok(line),
        Err(RecvTimeoutError::Timeout) => {
            let exit_info = match child.try_wait() {
                Ok(Some(status)) => format!(" (process exited with status: {status})"),
                Ok(None) => " (process still running)".to_string(),
                Err(e) => format!(" (could not check process status: {e})"),
            };
            eyre::bail!(
                "timed out after {timeout:?} waiting for '{needle}'{exit_info}\nCollected output:\n{}",
                collected()
            )
        }
        Err(RecvTimeoutError::Disconnected) => {
            let exit_info = match child.wait() {
                Ok(status) => format!("process exited with status: {status}"),
                Err(e) => format!("could not check process status: {e}"),
            };
            eyre::bail!(
                "output ended before '{needle}': {exit_info}\nCollected output:\n{}",
                collected()
            )
        }
    }
}
