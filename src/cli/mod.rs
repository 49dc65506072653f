use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use dirsync::Config;

mod connect;
mod info;
mod serve;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file. Defaults to config.ini, then bin/config.ini,
    /// then the per-user config directory.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version and the resolved configuration
    Info,
    /// Serve the configured directory to sync clients
    Serve,
    /// Mirror the server's directory and forward local changes to it
    Connect,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = Config::load(self.config.as_deref()).context("Failed to load configuration")?;
        match self.command {
            Commands::Info => info::run(&config)?,
            Commands::Serve => serve::run(config).await?,
            Commands::Connect => connect::run(config).await?,
        }
        Ok(())
    }
}

/// A token that fires on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        trigger.cancel();
    });
    cancel
}
