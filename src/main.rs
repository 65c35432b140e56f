use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use turnstile::admission::{AdmissionController, Janitor, RequestDescriptor, ThrottleResponse};
use turnstile::config::{LogFormat, LoggingConfig, TurnstileConfig};
use turnstile::ratelimit::Scope;

#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about = "Admission control for inference backends")]
struct Cli {
    /// YAML configuration file; `TURNSTILE__*` environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and print the effective values
    CheckConfig,

    /// Drive synthetic traffic through the limiter and report the outcome
    Simulate {
        /// Number of distinct clients
        #[arg(long, default_value_t = 5)]
        clients: usize,

        /// Requests sent by each client
        #[arg(long, default_value_t = 20)]
        requests: usize,

        /// Milliseconds between rounds of requests
        #[arg(long, default_value_t = 500)]
        spacing_ms: u64,

        /// Give each client its own session
        #[arg(long)]
        sessions: bool,
    },

    /// Hold a limiter with its janitor running until shutdown
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TurnstileConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::CheckConfig => {
            print!("{}", config.to_yaml()?);
            info!("Configuration is valid");
        }
        Command::Simulate {
            clients,
            requests,
            spacing_ms,
            sessions,
        } => simulate(config, clients, requests, Duration::from_millis(spacing_ms), sessions).await?,
        Command::Serve => serve(config).await?,
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn simulate(
    config: TurnstileConfig,
    clients: usize,
    requests: usize,
    spacing: Duration,
    sessions: bool,
) -> anyhow::Result<()> {
    let controller = Arc::new(AdmissionController::new(config)?);
    let janitor = Janitor::from_config(Arc::clone(&controller)).spawn();

    info!(clients = clients, requests = requests, "Starting simulation");

    let start = controller.now();
    let mut end = start;
    for round in 0..requests {
        let now = round_start(start, spacing, round)?;
        end = now;

        for client in 0..clients {
            let mut request = RequestDescriptor::new(format!("10.0.0.{}", client + 1), now);
            if sessions {
                request = request.with_session(format!("session-{}", client + 1));
            }

            let decision = controller.admit(&request);
            if let Some(response) = ThrottleResponse::from_decision(&decision) {
                debug!(
                    client = %request.client_id,
                    round = round,
                    body = %serde_json::to_string(&response)?,
                    "Request throttled"
                );
            }
        }
    }

    let statuses: Vec<_> = (0..clients)
        .map(|client| controller.status_at(Scope::Client, &format!("10.0.0.{}", client + 1), end))
        .collect();
    let report = json!({
        "stats": controller.aggregate_stats_at(end),
        "clients": statuses,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    janitor.shutdown().await?;
    Ok(())
}

/// Arrival time of simulated round `round`.
fn round_start(start: Instant, spacing: Duration, round: usize) -> anyhow::Result<Instant> {
    let round = u32::try_from(round).context("round number does not fit in u32")?;
    spacing
        .checked_mul(round)
        .and_then(|offset| start.checked_add(offset))
        .ok_or_else(|| anyhow!("round {} at {:?} spacing is past the clock's range", round, spacing))
}

async fn serve(config: TurnstileConfig) -> anyhow::Result<()> {
    let controller = Arc::new(AdmissionController::new(config)?);
    let janitor = Janitor::from_config(Arc::clone(&controller)).spawn();

    info!("Turnstile limiter running, press Ctrl+C to stop");
    shutdown_signal().await;

    janitor.shutdown().await?;

    let stats = controller.aggregate_stats();
    info!(
        admitted = stats.admitted_total,
        denied = stats.denied_total,
        internal_faults = stats.internal_faults,
        "Turnstile stopped"
    );
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
