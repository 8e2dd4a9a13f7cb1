//! `iscsi-reaper`: one reconciliation pass per invocation, meant to run as a
//! Kubernetes Job or CronJob on each storage node.

mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libreaper::inventory::{IscsiInventory, KubeClaimInventory, ZfsInventory};
use libreaper::reconciler::EXIT_PARTIAL;
use libreaper::{
    CommandRunner, HostCommandRunner, PassReport, ReaperError, Reconciler, StopSignal,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, LogFormat};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Returns true when the pass was already stopping and the process should
/// exit at once.
fn on_signal(stop: &StopSignal, name: &str) -> bool {
    if stop.is_stopped() {
        error!(signal = name, "second signal, exiting without finishing the current record");
        return true;
    }
    warn!(signal = name, "stopping after current record");
    stop.stop();
    false
}

/// Raise `stop` on SIGINT or SIGTERM. The deletion loop finishes the record
/// in flight and starts no other; a second signal exits immediately.
fn install_stop_handler(stop: StopSignal) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            if on_signal(&stop, name) {
                std::process::exit(i32::from(EXIT_PARTIAL));
            }
        }
    });
    Ok(())
}

async fn reconcile(cli: &Cli, stop: StopSignal) -> Result<PassReport, ReaperError> {
    let config = cli.reaper_config()?;

    info!(
        node = config.node_name.as_deref().unwrap_or("unknown"),
        mode = if config.dry_run { "dry-run" } else { "live" },
        exec = %config.exec_context,
        iqn_prefix = config.convention.iqn_prefix(),
        dataset = config.convention.dataset_root(),
        "starting reconciliation pass"
    );

    let runner: Arc<dyn CommandRunner> = Arc::new(HostCommandRunner::new(config.command_timeout));
    let claims = KubeClaimInventory::connect(config.convention.clone()).await?;

    let reconciler = Reconciler::new(
        IscsiInventory::new(runner.clone(), config.exec_context, config.convention.clone()),
        ZfsInventory::new(runner.clone(), config.exec_context, config.convention.clone()),
        claims,
        runner,
        &config,
    )
    .with_stop_signal(stop);

    Ok(reconciler.run().await?)
}

fn print_report(report: &PassReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize pass report")?;
    println!("{json}");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = cli::rejected_args_exit_code(&e);
            let _ = e.print();
            return ExitCode::from(code);
        }
    };
    init_tracing(cli.log_format);

    let stop = StopSignal::new();
    if let Err(e) = install_stop_handler(stop.clone()) {
        warn!(error = %e, "running without signal handling");
    }

    match reconcile(&cli, stop).await {
        Ok(report) => {
            for failure in report.failures() {
                error!(%failure, "unresolved stale record");
            }
            if cli.report_json
                && let Err(e) = print_report(&report)
            {
                error!(error = %e, "failed to print report");
            }
            if !report.succeeded() {
                warn!(
                    failed = report.failed,
                    cancelled = report.cancelled,
                    "pass finished with unresolved stale records"
                );
            }
            ExitCode::from(report.exit_code())
        }
        Err(e) => {
            error!(error = %e, "pass aborted, no node records deleted");
            ExitCode::from(e.exit_code())
        }
    }
}
