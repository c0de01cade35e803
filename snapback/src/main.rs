//! Snapback - main entry point
//!
//! Runs one backup pass over every configured target and backup set, then
//! delivers the consolidated report.

use anyhow::Result;
use clap::Parser;
use snapback::remote::{ProcessRunner, RemoteExecutor};
use snapback::report::{Notifier, Report, SmtpNotifier, StdoutNotifier};
use snapback::run::BackupRun;
use snapback::shutdown::ShutdownCoordinator;
use snapback::{utils, Config, Orchestrator, SnapbackError};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON settings file
    #[arg(value_name = "FILE")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the settings file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print the report to stdout instead of mailing it
    #[arg(long)]
    no_email: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Configuration errors are fatal: nothing runs, nothing is sent.
    let config = Config::from_file(&args.config).map_err(SnapbackError::Config)?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.loglevel);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting snapback v{} ({} targets, {} backup sets)",
        env!("CARGO_PKG_VERSION"),
        config.backuptargets.len(),
        config.backupsets.len()
    );

    let shutdown = ShutdownCoordinator::new();
    let cancel = shutdown.token();
    let signal_handle = tokio::spawn(async move {
        shutdown.wait_for_signal().await;
    });

    let executor = RemoteExecutor::from_config(ProcessRunner, &config);
    let run = BackupRun::new(&config, Orchestrator::new(executor));
    let aggregator = run.execute(cancel).await;
    signal_handle.abort();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let report = aggregator.build_report(&hostname);
    tracing::info!("{}", report.subject);

    let notifier: Box<dyn Notifier> = if args.no_email {
        Box::new(StdoutNotifier)
    } else {
        Box::new(SmtpNotifier::from_config(&config.smtp))
    };

    if let Err(e) = deliver(notifier, report).await {
        tracing::error!("Failed to deliver report: {}", e);
        return Err(e.into());
    }

    if aggregator.has_errors() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Send the report from a blocking thread; SMTP delivery is synchronous.
async fn deliver(notifier: Box<dyn Notifier>, report: Report) -> utils::Result<()> {
    tokio::task::spawn_blocking(move || notifier.send(&report))
        .await
        .map_err(|e| SnapbackError::Notify(e.to_string()))?
        .map_err(|e| SnapbackError::Notify(format!("{e:#}")))
}
