use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::WrapErr;
use host::{HandlerOptions, RequestHandler, Termination};
use process::{ProcessHelper, SystemProcessHelper};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use transport::{ConnectionInfo, ConnectionRole};

mod diagnostics;
mod managers;

use diagnostics::DiagnosticsLog;
use managers::DefaultManagers;

const EXIT_STARTUP_FAILURE: i32 = 1;
const EXIT_PARENT_EXITED: i32 = 3;

/// Test host worker: connects to a runner and answers its discovery and
/// execution requests
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Port of a runner listening on the loopback interface
    #[clap(long, conflicts_with = "endpoint")]
    port: Option<u16>,

    /// Address to dial, or to listen on with `--role host`
    #[clap(long)]
    endpoint: Option<String>,

    /// `client` dials the runner, `host` listens for it
    #[clap(long, default_value_t = ConnectionRole::Client)]
    role: ConnectionRole,

    /// Exit when this process exits
    #[clap(long = "parentprocessid")]
    parent_process_id: Option<u32>,

    /// Diagnostics log file
    #[clap(long)]
    diag: Option<PathBuf>,

    /// Settings file
    #[clap(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn connection_info(&self) -> eyre::Result<ConnectionInfo> {
        let endpoint = match (&self.endpoint, self.port, self.role) {
            (Some(endpoint), _, _) => endpoint.clone(),
            (None, Some(port), _) => format!("127.0.0.1:{port}"),
            (None, None, ConnectionRole::Host) => transport::DEFAULT_ENDPOINT.to_string(),
            (None, None, ConnectionRole::Client) => {
                eyre::bail!("--port or --endpoint is required to connect to a runner")
            }
        };
        Ok(ConnectionInfo::new(endpoint, self.role))
    }
}

fn main() {
    let args = Args::parse();
    let diagnostics = DiagnosticsLog::default();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::from_default_env()),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(diagnostics.clone())
                .with_filter(LevelFilter::DEBUG),
        )
        .init();

    if let Err(e) = color_eyre::install() {
        tracing::warn!(error = %e, "could not install error report handler");
    }
    tracing::debug!(?args, "parsed command line arguments");

    let code = match run(&args, diagnostics) {
        Ok(termination) => termination.exit_code(),
        Err(e) => {
            tracing::error!(error = ?e, "test host failed");
            EXIT_STARTUP_FAILURE
        }
    };
    std::process::exit(code);
}

fn run(args: &Args, diagnostics: DiagnosticsLog) -> eyre::Result<Termination> {
    let mut settings = config::Settings::load(args.config.as_deref()).context("loading settings")?;
    if let Some(diag) = &args.diag {
        settings.diagnostics = Some(diag.clone());
    }
    let connection = args.connection_info()?;

    let processes = SystemProcessHelper::new(settings.watchdog_interval());
    tracing::info!(
        pid = processes.current_process_id(),
        architecture = %processes.current_process_architecture(),
        "test host starting"
    );

    // held for the lifetime of the session
    let _watchdog = args
        .parent_process_id
        .map(|pid| {
            processes.set_exit_callback(
                pid,
                Box::new(|pid| {
                    tracing::error!(pid, "runner process exited, shutting down");
                    std::process::exit(EXIT_PARENT_EXITED);
                }),
            )
        })
        .transpose()
        .context("watching parent process")?;

    let mut handler = RequestHandler::new(&connection, HandlerOptions::from(&settings))?;
    if let Some(path) = settings.diagnostics.clone() {
        diagnostics.set_path(path);
        handler = handler.with_diagnostics(Arc::new(diagnostics));
    }

    let address = handler.initialize_communication()?;
    if connection.role == ConnectionRole::Host {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "{}{address}", process::launcher::READY_MARKER)?;
        stdout.flush()?;
    }

    let timeout = settings.connection_timeout();
    if !handler.wait_for_request_sender_connection(timeout) {
        handler.close();
        eyre::bail!("runner did not connect to {address} within {timeout:?}");
    }

    handler.process_requests(&DefaultManagers::default());
    handler.close();

    let termination = handler.termination().unwrap_or(Termination::Abnormal);
    match termination {
        Termination::Clean => tracing::info!("session complete"),
        other => tracing::error!(termination = ?other, "session did not end cleanly"),
    }
    Ok(termination)
}
