use anyhow::Result;

use dirsync::protocol::PROTOCOL_VERSION;
use dirsync::Config;

pub fn run(config: &Config) -> Result<()> {
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Protocol version: {}", PROTOCOL_VERSION);
    println!("Configuration: {:#?}", config);
    Ok(())
}
