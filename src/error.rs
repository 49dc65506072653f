use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },
    #[error("Short write: {0}")]
    ShortWrite(#[source] io::Error),
    #[error("Transfer error: {0}")]
    Transfer(String),
    #[error("Filesystem error on {path:?}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Archiver error: {0}")]
    Archiver(String),
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SyncError {
    pub fn fs(path: impl AsRef<Path>, source: io::Error) -> Self {
        SyncError::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Short reads and incomplete payloads both surface as transfer failures
    /// once a payload has been announced.
    pub fn into_transfer(self, what: &str) -> Self {
        match self {
            SyncError::ShortRead { expected, received } => SyncError::Transfer(format!(
                "{what} incomplete: expected {expected} bytes, received {received}"
            )),
            SyncError::Io(e) => SyncError::Transfer(format!("{what} failed: {e}")),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
