use anyhow::{Context, Result};
use tracing::info;

use dirsync::config::Role;
use dirsync::{Config, SyncServer};

pub async fn run(config: Config) -> Result<()> {
    config.validate(Role::Server)?;
    let directory = config.directory.clone();

    let server = SyncServer::bind(config)
        .await
        .context("Failed to start the server")?;
    info!(
        "Listening for clients on {} and changes on {}",
        server.control_addr()?,
        server.change_addr()?
    );

    server.run(super::shutdown_token()).await?;
    info!("Stopped serving {:?}", directory);
    Ok(())
}
