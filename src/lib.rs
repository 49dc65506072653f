pub mod change;
pub mod client;
pub mod config;
pub mod error;
pub mod obfuscation;
pub mod paths;
pub mod protocol;
pub mod server;
pub mod snapshot;
pub mod tree;
pub mod watcher;
pub mod wire;

pub use client::{ClientSession, SyncClient};
pub use config::Config;
pub use error::{Result, SyncError};
pub use server::SyncServer;
