use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dowe::config::Config;
use dowe::lifecycle;

/// Host-level reverse proxy: per-host backend processes supervised on Unix
/// sockets, routed by one HTTP/HTTPS front end.
#[derive(Parser, Debug)]
#[command(name = "dowed")]
struct Cli {
    /// Overrides DATA_DIR from the environment.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Overrides SOCKETS_DIR from the environment.
    #[arg(long)]
    sockets_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("loading configuration from environment")?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(sockets_dir) = cli.sockets_dir {
        config.sockets_dir = sockets_dir;
    }

    lifecycle::run(config)
        .await
        .context("service exited with an error")
}
