use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::server;

#[derive(Debug, Parser)]
#[command(name = "graphgate", version, about = "Multi-tenant graph gateway")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Serve(ServeArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Listen address for the gateway.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,
    /// Gateway port. 0 picks a free port.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    /// Optional file path to write the resolved listener address.
    #[arg(long, hide = true)]
    pub port_file: Option<PathBuf>,
}

pub async fn run(cli: Cli, config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => server::serve(args, config, shutdown).await,
    }
}
