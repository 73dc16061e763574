//! ctrlplane
//!
//! `ctrlplane controller` accepts agent connections; `ctrlplane agent` dials
//! a controller and runs the tasks it is asked to. Configuration is JSON,
//! see [`ctrlplane::config`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ctrlplane::channel::ChannelMetrics;
use ctrlplane::client::{Client, ClientConfig, InMemoryState};
use ctrlplane::config::Config;
use ctrlplane::registry::{
    Handlers, Registry, RegistryConfig, RegistryMetrics, StaticAuthenticator,
};
use ctrlplane::runner::{process, ProcessBuilder, TaskRouter};
use ctrlplane::server;
use ctrlplane::transport::TcpConnector;

#[derive(Parser, Debug)]
#[command(name = "ctrlplane")]
#[command(about = "Agent/controller control plane")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to a JSON config file (default: $CTRLPLANE_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Print collected metrics to stdout on exit
    #[arg(long, global = true)]
    print_metrics: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept agent connections
    Controller {
        /// Listen address, overrides the config
        #[arg(long)]
        listen: Option<String>,
    },
    /// Connect to a controller and run tasks
    Agent {
        /// Agent ID, overrides the config
        #[arg(long)]
        id: Option<String>,

        /// Controller address, overrides the config
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays free for the metrics dump
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let metrics = prometheus::Registry::new();
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match args.command {
        Command::Controller { listen } => {
            if let Some(listen) = listen {
                config.controller.listen = listen;
            }
            run_controller(&config, &metrics, shutdown).await?;
        }
        Command::Agent { id, server } => {
            if let Some(id) = id {
                config.agent.id = id;
            }
            if let Some(server) = server {
                config.agent.server = server;
            }
            run_agent(&config, &metrics, shutdown).await?;
        }
    }

    if args.print_metrics {
        print_metrics(&metrics)?;
    }
    Ok(())
}

async fn run_controller(
    config: &Config,
    metrics: &prometheus::Registry,
    shutdown: CancellationToken,
) -> Result<()> {
    let section = &config.controller;
    if section.principals.is_empty() {
        warn!("No principals configured, every agent will be rejected");
    }

    let registry_metrics = RegistryMetrics::new(&section.metrics_namespace)
        .context("Failed to create registry metrics")?;
    metrics
        .register(Box::new(registry_metrics.clone()))
        .context("Failed to register registry metrics")?;

    let registry = Arc::new(Registry::new(
        RegistryConfig::from_config(section),
        Arc::new(StaticAuthenticator::new(section.principals.clone())),
        Handlers::logging(),
        registry_metrics,
    ));

    let listener = TcpListener::bind(&section.listen)
        .await
        .with_context(|| format!("Failed to bind {}", section.listen))?;
    info!(
        listen = %section.listen,
        principals = section.principals.len(),
        "Controller started"
    );

    server::serve(listener, registry, shutdown).await;
    Ok(())
}

async fn run_agent(
    config: &Config,
    metrics: &prometheus::Registry,
    shutdown: CancellationToken,
) -> Result<()> {
    let channel_metrics = ChannelMetrics::new(&config.agent.metrics_namespace)
        .context("Failed to create channel metrics")?;
    metrics
        .register(Box::new(channel_metrics.clone()))
        .context("Failed to register channel metrics")?;

    let router = TaskRouter::new().with(process::KIND, Arc::new(ProcessBuilder));
    info!(
        agent_id = %config.agent.id,
        server = %config.agent.server,
        kinds = ?router.kinds().collect::<Vec<_>>(),
        "Agent started"
    );

    let client = Client::new(
        ClientConfig::from_config(&config.agent),
        Arc::new(TcpConnector::new(config.agent.server.clone())),
        router,
        Arc::new(InMemoryState::default()),
    )
    .with_metrics(channel_metrics);

    client.run(shutdown).await;
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for interrupt, shutting down"),
        }
        shutdown.cancel();
    });
}

fn print_metrics(metrics: &prometheus::Registry) -> Result<()> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metrics.gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    print!("{}", String::from_utf8_lossy(&buffer));
    Ok(())
}
