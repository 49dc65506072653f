use anyhow::{Context, Result};
use tracing::info;

use dirsync::config::Role;
use dirsync::{Config, SyncClient};

pub async fn run(config: Config) -> Result<()> {
    config.validate(Role::Client)?;
    let directory = config.directory.clone();
    let server = config.control_addr();

    info!("Performing initial sync from {}...", server);
    let client = SyncClient::connect(config)
        .await
        .with_context(|| format!("Failed to bootstrap from {server}"))?;
    info!("Sync established! Watching for changes at {:?}", directory);

    client.run(super::shutdown_token()).await?;
    Ok(())
}
