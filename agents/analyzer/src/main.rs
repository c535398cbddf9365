//! Sandbox Analyzer Agent
//!
//! In-guest coordinator for dynamic analysis runs:
//! - Accepts process announcements over a local command channel
//! - Hands announced processes to the injector
//! - Ends the run when the monitored processes are gone, the package says so,
//!   or the time budget runs out

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use analyzer_agent::bootstrap::HostBootstrap;
use analyzer_agent::config::Config;
use analyzer_agent::controller::{Collaborators, RunController, RunReport, RunSettings};
use analyzer_agent::exporters::{spawn_event_task, OtlpExporter};
use analyzer_agent::liveness::SignalProbe;
use analyzer_agent::package::PackageCatalog;
use analyzer_agent::{events, gateway};

/// How long to wait for queued events to be exported after the run.
const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "analyzer-agent")]
#[command(about = "In-guest coordination agent for dynamic analysis runs")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/analyzer/agent.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Analysis package to run (overrides package.name)
    #[arg(short, long)]
    package: Option<String>,

    /// Target executable for the package (overrides package.target)
    #[arg(short, long)]
    target: Option<PathBuf>,

    /// Run time budget in seconds (overrides run.timeout_secs)
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting analyzer agent");

    let report = match run(args).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Agent failed to start");
            RunReport::aborted(format!("{e:#}"))
        }
    };

    println!("{report}");

    if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run(args: Args) -> Result<RunReport> {
    let mut config = Config::load(&args.config).context("Failed to load configuration")?;
    if let Some(package) = args.package {
        config.package.name = package;
    }
    if let Some(target) = args.target {
        config.package.target = Some(target);
    }
    if let Some(timeout) = args.timeout {
        config.run.timeout_secs = timeout;
    }

    info!(
        channel = %config.channel.path.display(),
        package = %config.package.name,
        timeout_secs = config.run.timeout_secs,
        "Configuration loaded"
    );

    let exporter = if config.collector.enabled {
        let exporter =
            OtlpExporter::new(&config.collector).context("Failed to create OTLP exporter")?;
        info!(endpoint = %config.collector.endpoint, "Exporting events to collector");
        Some(exporter)
    } else {
        None
    };
    let (event_tx, event_rx) = events::channel();
    let event_task = spawn_event_task(event_rx, exporter);

    let injector =
        gateway::from_config(&config.injector).context("Invalid injector configuration")?;

    let controller = RunController::new(
        RunSettings {
            channel: config.channel.clone(),
            package: config.package.clone(),
            timeout: config.run.timeout(),
            poll_interval: config.run.poll_interval(),
        },
        Collaborators {
            bootstrap: Box::new(HostBootstrap::new(&config.paths)),
            catalog: PackageCatalog::builtin(),
            gateway: injector,
            liveness: Arc::new(SignalProbe),
            events: event_tx,
        },
    );

    let report = controller.run().await;

    // Handlers still in flight keep their senders; don't wait for them forever.
    if tokio::time::timeout(EVENT_FLUSH_TIMEOUT, event_task).await.is_err() {
        warn!("Timed out flushing agent events");
    }

    if let Some(path) = &config.report.path {
        match write_report(path, &report) {
            Ok(()) => info!(path = %path.display(), "Report written"),
            Err(e) => warn!(path = %path.display(), error = %format!("{e:#}"), "Failed to write report"),
        }
    }

    Ok(report)
}

fn write_report(path: &std::path::Path, report: &RunReport) -> Result<()> {
    let json = serde_json::to_vec_pretty(report).context("Failed to serialize report")?;
    std::fs::write(path, json).context("Failed to write report file")?;
    Ok(())
}
