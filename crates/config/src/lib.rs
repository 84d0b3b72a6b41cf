//! Test host settings
//!
//! Settings come from an optional TOML file, then environment variables
//! override individual values. Command line arguments are applied on top by
//! the binary.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::WrapErr;
use serde::{Deserialize, Serialize};

pub const ENV_CONNECTION_TIMEOUT: &str = "TESTHOST_CONNECTION_TIMEOUT";
pub const ENV_DEBUGGER_ATTACH_TIMEOUT: &str = "TESTHOST_DEBUGGER_ATTACH_TIMEOUT";
pub const ENV_JOB_QUEUE_MAX_SIZE: &str = "TESTHOST_JOB_QUEUE_MAX_SIZE";
pub const ENV_DIAGNOSTICS: &str = "TESTHOST_DIAG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Seconds to wait for the runner to connect
    pub connection_timeout: u64,
    /// Seconds to wait for the runner to launch or attach a debugger
    pub debugger_attach_timeout: u64,
    /// Milliseconds between parent process liveness checks
    pub watchdog_interval: u64,
    pub highest_supported_version: u32,
    /// Write a diagnostics log here once the handshake enables it
    pub diagnostics: Option<PathBuf>,
    pub job_queue: JobQueueSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQueueSettings {
    pub max_length: usize,
    /// Bytes of outgoing messages allowed to wait before senders block
    pub max_size: usize,
    /// Seconds to wait for queued messages at session end
    pub flush_timeout: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection_timeout: 90,
            debugger_attach_timeout: 180,
            watchdog_interval: 1000,
            highest_supported_version: 6,
            diagnostics: None,
            job_queue: JobQueueSettings::default(),
        }
    }
}

impl Default for JobQueueSettings {
    fn default() -> Self {
        Self {
            max_length: 500,
            max_size: 25_000_000,
            flush_timeout: 10,
        }
    }
}

impl Settings {
    /// Default location of the settings file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("testhost").join("config.toml"))
    }

    /// Load settings and apply overrides from the process environment.
    ///
    /// An explicitly given `path` must exist. Without one the default
    /// location is used if there is a file there, otherwise the defaults.
    #[tracing::instrument]
    pub fn load(path: Option<&Path>) -> eyre::Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|path| path.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    tracing::debug!("no settings file, using defaults");
                    Self::default()
                }
            },
        };
        settings.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> eyre::Result<Self> {
        let contents = fs::read_to_string(path)
            .wrap_err_with(|| format!("reading settings file {}", path.display()))?;
        let settings = Self::from_toml(&contents)
            .wrap_err_with(|| format!("parsing settings file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded settings file");
        Ok(settings)
    }

    pub fn from_toml(contents: &str) -> eyre::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Override values from environment variables, read through `lookup`.
    ///
    /// Values that do not parse are logged and ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_var(&lookup, ENV_CONNECTION_TIMEOUT) {
            self.connection_timeout = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_DEBUGGER_ATTACH_TIMEOUT) {
            self.debugger_attach_timeout = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_JOB_QUEUE_MAX_SIZE) {
            self.job_queue.max_size = value;
        }
        if let Some(path) = lookup(ENV_DIAGNOSTICS).filter(|value| !value.trim().is_empty()) {
            self.diagnostics = Some(PathBuf::from(path));
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn debugger_attach_timeout(&self) -> Duration {
        Duration::from_secs(self.debugger_attach_timeout)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.job_queue.flush_timeout)
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring invalid environment override");
            None
        }
    }
}
