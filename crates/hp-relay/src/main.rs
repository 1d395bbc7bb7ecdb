//! hargproxy daemon
//!
//! Runs between a Hargassner IGW gateway and the boiler it manages, relaying
//! discovery and the TCP command session while decoding telemetry.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hp_core::config::{self, RelayConfig};
use hp_relay::{Orchestrator, RelayFactory};

#[derive(Parser)]
#[command(name = "hargproxy")]
#[command(about = "Relay between a Hargassner IGW gateway and its boiler")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interface facing the gateway (overrides config)
    #[arg(long)]
    gateway_interface: Option<String>,

    /// Interface facing the boiler (overrides config)
    #[arg(long)]
    boiler_interface: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print info and track traffic to stdout as JSON lines
    #[arg(long)]
    tap: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = effective_config(&args)?;

    if args.print_config {
        let text = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
        print!("{}", text);
        return Ok(());
    }

    tracing::info!(
        "hargproxy starting (gateway on {}, boiler on {})",
        config.network.gateway_interface,
        config.network.boiler_interface
    );

    let stop = CancellationToken::new();
    tokio::spawn(cancel_on_signal(stop.clone()));

    let config = Arc::new(config);
    let factory = RelayFactory::new(Arc::clone(&config));
    let mut orchestrator = Orchestrator::new(factory, &config, stop);
    orchestrator.run().await?;

    tracing::info!("hargproxy shutdown complete");
    Ok(())
}

/// Configuration file (or defaults) with command-line overrides applied
fn effective_config(args: &Args) -> Result<RelayConfig> {
    let mut config: RelayConfig = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => {
            let path = config::default_config_path();
            config::load_or_default(&path).unwrap_or_else(|e| {
                tracing::warn!("Ignoring {:?}: {}", path, e);
                RelayConfig::default()
            })
        }
    };

    if let Some(interface) = &args.gateway_interface {
        config.network.gateway_interface = interface.clone();
    }
    if let Some(interface) = &args.boiler_interface {
        config.network.boiler_interface = interface.clone();
    }
    if args.tap {
        config.session.tap = true;
    }
    Ok(config)
}

/// Cancel `stop` on Ctrl+C or SIGTERM
async fn cancel_on_signal(stop: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let signal = tokio::select! {
        _ = tokio::signal::ctrl_c() => "Ctrl+C",
        _ = terminate => "SIGTERM",
    };
    tracing::info!("{} received, stopping", signal);
    stop.cancel();
}
