//! agmon-live - creation pipeline live monitor
//!
//! Submits or follows a server-side agent creation and prints every monitor
//! event as one JSON line on stdout. Diagnostics go to stderr.
//!
//! Exit status: 0 completed, 1 failed or abandoned, 130 interrupted.

use agmon_common::config::{load_or_default, CONFIG_ENV_VAR};
use agmon_common::events::{EventBus, MonitorEvent, ResolvedResource};
use agmon_live::services::{PendingStore, SessionStart};
use agmon_live::{ConfigOverrides, HttpBackend, Monitor, MonitorConfig, SessionOutcome};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for agmon-live
#[derive(Parser, Debug)]
#[command(name = "agmon-live")]
#[command(about = "Live monitor for the agent creation pipeline")]
#[command(version)]
struct Args {
    /// Bootstrap TOML file
    #[arg(long, global = true, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Backend base URL
    #[arg(long, global = true)]
    backend_url: Option<String>,

    /// Directory for the pending creation handle
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow an existing resource
    Watch {
        #[arg(long)]
        resource_id: String,
    },
    /// Submit a creation request and follow it
    Create {
        /// Human-given key of the new resource, e.g. its site URL
        #[arg(long = "key")]
        lookup_key: String,
    },
    /// Resume the pending creation saved by an interrupted `create`
    Resume,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let toml_config = load_or_default(args.config.as_deref())?;
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| toml_config.logging.level.clone());

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "agmon_live={level},agmon_common={level},warn"
                ))
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting agmon-live {}", env!("CARGO_PKG_VERSION"));

    let config = MonitorConfig::resolve(
        &toml_config,
        ConfigOverrides {
            backend_url: args.backend_url,
            state_dir: args.state_dir,
            log_level: args.log_level,
        },
    )
    .context("Invalid configuration")?;

    let backend = HttpBackend::new(&config.backend_url, config.request_timeout)
        .context("Failed to initialize backend client")?;
    let store = PendingStore::new(config.pending_file());
    let monitor = Monitor::new(config, Arc::new(backend));

    let tracks_pending = !matches!(args.command, Command::Watch { .. });
    let printer = spawn_printer(
        monitor.event_bus(),
        tracks_pending.then(|| PendingStore::new(store.path())),
    );

    let start = match args.command {
        Command::Watch { resource_id } => SessionStart::Resolved(ResolvedResource::new(resource_id)),
        Command::Create { lookup_key } => {
            let outcome = monitor
                .submit(&lookup_key)
                .await
                .with_context(|| format!("Failed to submit creation for '{}'", lookup_key))?;
            let start = SessionStart::from(outcome);
            if let SessionStart::Pending(pending) = &start {
                store.save(pending)?;
            }
            start
        }
        Command::Resume => {
            let pending = store
                .load()?
                .with_context(|| format!("No pending creation in {}", store.path().display()))?;
            info!(lookup_key = %pending.lookup_key, "Resuming pending creation");
            SessionStart::Pending(pending)
        }
    };

    let handle = monitor.start(start);
    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping session");
            token.cancel();
        }
    });

    let outcome = handle.wait().await;

    // Last sender gone: the printer drains what is left and stops.
    drop(monitor);
    match tokio::time::timeout(Duration::from_secs(2), printer).await {
        Ok(Err(e)) => warn!("Event printer ended abnormally: {}", e),
        Err(_) => warn!("Event printer did not drain in time"),
        Ok(Ok(())) => {}
    }

    Ok(match outcome {
        SessionOutcome::Completed { resource_id } => {
            info!(resource_id = %resource_id, "Creation completed");
            ExitCode::SUCCESS
        }
        SessionOutcome::Failed { resource_id, reason } => {
            error!(resource_id = %resource_id, "Creation failed: {}", reason);
            ExitCode::from(1)
        }
        SessionOutcome::Abandoned { pending, reason } => {
            error!(
                lookup_key = %pending.lookup_key,
                "Stopped waiting for resource id: {} (run `agmon-live resume` to retry)",
                reason
            );
            ExitCode::from(1)
        }
        SessionOutcome::Cancelled => ExitCode::from(130),
    })
}

/// Print every event as a JSON line; clear the pending handle once resolved
fn spawn_printer(event_bus: &EventBus, pending: Option<PendingStore>) -> JoinHandle<()> {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        let stdout = std::io::stdout();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let (MonitorEvent::ResourceResolved { .. }, Some(store)) = (&event, &pending) {
                        if let Err(e) = store.clear() {
                            warn!("Failed to clear pending creation: {}", e);
                        }
                    }
                    match serde_json::to_string(&event) {
                        Ok(line) => {
                            let mut out = stdout.lock();
                            if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(event = event.event_type(), "Failed to serialize event: {}", e),
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Output fell behind, {} events dropped", n),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
