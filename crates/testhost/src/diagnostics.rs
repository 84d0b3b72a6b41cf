//! Diagnostics log file, switched on by the runner's handshake
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use eyre::WrapErr;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Default)]
struct Inner {
    path: Option<PathBuf>,
    file: Option<File>,
}

/// Tracing writer that discards output until [`host::Diagnostics::enable`]
/// opens the diagnostics file
#[derive(Clone, Default)]
pub struct DiagnosticsLog {
    inner: Arc<Mutex<Inner>>,
}

impl DiagnosticsLog {
    pub fn set_path(&self, path: PathBuf) {
        self.lock().path = Some(path);
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().file.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl host::Diagnostics for DiagnosticsLog {
    fn enable(&self) -> eyre::Result<()> {
        let mut inner = self.lock();
        if inner.file.is_some() {
            return Ok(());
        }
        let Some(path) = inner.path.clone() else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .wrap_err_with(|| format!("creating diagnostics directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .wrap_err_with(|| format!("opening diagnostics file {}", path.display()))?;
        inner.file = Some(file);
        drop(inner);

        tracing::info!(path = %path.display(), "diagnostics enabled");
        Ok(())
    }
}

pub struct DiagnosticsWriter {
    inner: Arc<Mutex<Inner>>,
}

impl Write for DiagnosticsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.file.as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DiagnosticsLog {
    type Writer = DiagnosticsWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DiagnosticsWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}
