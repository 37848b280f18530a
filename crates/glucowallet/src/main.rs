//! glucowallet - follow a LibreLinkUp patient and republish each glucose
//! reading to InfluxDB.
//!
//! Runs until Ctrl-C or SIGTERM. Polling failures are logged and retried;
//! only a bad configuration stops the process.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use glucowallet_core::{
    load_settings, InfluxSink, LinkUpClient, PointPublisher, Poller, SessionManager, Settings,
};

/// File name prefix for rotated log files
const LOG_FILE_PREFIX: &str = "glucowallet.log";

#[derive(Parser)]
#[command(name = "glucowallet", version)]
#[command(about = "Republish LibreLinkUp glucose readings to InfluxDB", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/glucowallet/config.json)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Write logs to a daily rotated file in this directory instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Override the poll interval, in seconds
    #[arg(long)]
    interval: Option<u64>,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,
}

/// Initialize the tracing subscriber for logging.
/// Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug).
fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            Ok(None)
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn build_poller(settings: &Settings) -> Result<Poller<LinkUpClient, InfluxSink>> {
    let mut client = LinkUpClient::with_timeout(settings.request_timeout)
        .context("Failed to build LinkUp client")?;
    if let Some(ref region) = settings.region {
        client = client.with_region(region);
    }

    let sink = InfluxSink::new(settings.influx.clone(), settings.request_timeout)
        .context("Failed to build InfluxDB client")?
        .with_retries(settings.sink_max_retries, settings.sink_retry_backoff);

    let publisher = PointPublisher::new(sink, settings.measurement.clone());
    let sessions = SessionManager::new(settings.credentials.clone(), settings.patient_id.clone());

    Ok(Poller::new(client, publisher, sessions, settings.poll))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref())?;

    let mut settings =
        load_settings(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(secs) = cli.interval {
        if secs == 0 {
            bail!("--interval must be greater than zero");
        }
        settings.poll.interval = Duration::from_secs(secs);
    }

    info!(
        username = %settings.credentials.username(),
        influx_url = %settings.influx.url,
        bucket = %settings.influx.bucket,
        measurement = %settings.measurement,
        interval_secs = settings.poll.interval.as_secs(),
        "glucowallet starting"
    );

    let poller = build_poller(&settings)?;

    if cli.once {
        let report = poller.trigger().await;
        return Ok(if report.outcome.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    poller.run(shutdown_signal()).await;
    info!("glucowallet stopped");
    Ok(ExitCode::SUCCESS)
}
