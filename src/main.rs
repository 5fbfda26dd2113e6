// MIT License

//! `telenot-sim` — standalone panel simulator daemon.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use telenot_gms::{Simulator, SimulatorConfig};

#[derive(Debug, Parser)]
#[command(name = "telenot-sim", about = "Telenot GMS panel simulator", version)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<SimulatorConfig>(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => SimulatorConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }

    let simulator = Simulator::bind(config).await?;
    info!("Simulator ready on {}", simulator.local_addr());

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");
    simulator.shutdown().await;
    Ok(())
}
