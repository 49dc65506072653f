//! A synchronized directory and the lock that serializes changes to it.
//!
//! Incoming file content is staged without the lock, beside its target, and
//! only the final rename, delete or move happens while the lock is held. A
//! slow or silent peer therefore never holds up anyone else.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::paths;
use crate::snapshot::SnapshotTransfer;
use crate::wire::WireCodec;

/// Name prefix of files whose content is still arriving.
pub const INCOMING_PREFIX: &str = ".dirsync-incoming-";

/// One side's copy of the synchronized directory.
///
/// Every mutation goes through a [`TreeGuard`], so all of them are
/// serialized by one lock.
#[derive(Debug)]
pub struct DirectoryTree {
    root: PathBuf,
    lock: Mutex<()>,
}

impl DirectoryTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn lock(&self) -> TreeGuard<'_> {
        TreeGuard {
            root: &self.root,
            _held: self.lock.lock().await,
        }
    }

    /// Receives `len` bytes from `reader` into a temporary file beside the
    /// target of `wire`. Nothing appears under the real name until the
    /// result is passed to [`TreeGuard::commit`].
    ///
    /// A `Filesystem` error means the payload was consumed and the stream is
    /// still usable; any other error leaves it out of step.
    pub async fn stage<R: AsyncRead + Unpin>(
        &self,
        codec: &WireCodec,
        reader: &mut R,
        wire: &str,
        len: u64,
    ) -> Result<StagedFile> {
        let target = paths::resolve(&self.root, wire)?;
        let file = match stage_beside(&target) {
            Ok(file) => file,
            Err(e) => {
                codec
                    .receive_stream(reader, &mut tokio::io::sink(), len)
                    .await
                    .map_err(|e| e.into_transfer("file payload"))?;
                return Err(e);
            }
        };

        let std_file = file
            .as_file()
            .try_clone()
            .map_err(|e| SyncError::fs(file.path(), e))?;
        let mut out = tokio::fs::File::from_std(std_file);
        codec
            .receive_stream(reader, &mut out, len)
            .await
            .map_err(|e| e.into_transfer("file payload"))?;
        out.shutdown()
            .await
            .map_err(|e| SyncError::fs(file.path(), e))?;
        debug!("Staged {} bytes for {}", len, wire);

        Ok(StagedFile {
            wire: wire.to_string(),
            target,
            file,
            len,
        })
    }
}

/// File content that arrived in full and waits to replace its target.
///
/// Dropping it removes the temporary file.
#[derive(Debug)]
pub struct StagedFile {
    wire: String,
    target: PathBuf,
    file: NamedTempFile,
    len: u64,
}

impl StagedFile {
    pub fn wire(&self) -> &str {
        &self.wire
    }

    pub fn size(&self) -> u64 {
        self.len
    }
}

/// Exclusive access to the tree for one action.
pub struct TreeGuard<'a> {
    root: &'a Path,
    _held: MutexGuard<'a, ()>,
}

impl TreeGuard<'_> {
    pub fn resolve(&self, wire: &str) -> Result<PathBuf> {
        paths::resolve(self.root, wire)
    }

    /// Renames staged content over its target, replacing any existing file.
    pub fn commit(&self, staged: StagedFile) -> Result<()> {
        let StagedFile {
            wire,
            target,
            file,
            len,
        } = staged;
        file.persist(&target)
            .map_err(|e| SyncError::fs(&target, e.error))?;
        info!("Wrote {} ({} bytes)", wire, len);
        Ok(())
    }

    /// Removes the file at `wire`, or the directory tree if that is what it names.
    pub async fn delete(&self, wire: &str) -> Result<()> {
        let target = self.resolve(wire)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} is already gone", wire);
                return Ok(());
            }
            Err(_) => tokio::fs::remove_dir_all(&target)
                .await
                .map_err(|e| SyncError::fs(&target, e))?,
        }
        info!("Deleted {}", wire);
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::fs(parent, e))?;
        }
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| SyncError::fs(&source, e))?;
        info!("Renamed {} to {}", from, to);
        Ok(())
    }

    /// Reads a file as it stands while the guard is held.
    pub async fn read(&self, wire: &str) -> Result<Vec<u8>> {
        let target = self.resolve(wire)?;
        tokio::fs::read(&target)
            .await
            .map_err(|e| SyncError::fs(&target, e))
    }

    /// Archives the tree as it stands while the guard is held.
    pub async fn pack(&self, transfer: &SnapshotTransfer) -> Result<NamedTempFile> {
        transfer.pack(self.root).await
    }
}

fn stage_beside(target: &Path) -> Result<NamedTempFile> {
    let parent = target
        .parent()
        .ok_or_else(|| SyncError::Protocol(format!("{target:?} has no parent directory")))?;
    std::fs::create_dir_all(parent).map_err(|e| SyncError::fs(parent, e))?;
    let staged = tempfile::Builder::new()
        .prefix(INCOMING_PREFIX)
        .tempfile_in(parent)
        .map_err(|e| SyncError::fs(parent, e))?;
    keep_permissions(target, &staged)?;
    Ok(staged)
}

/// Temporary files start out private; give the staged file the target's
/// permissions, or ordinary ones for a new file.
#[cfg(unix)]
fn keep_permissions(target: &Path, staged: &NamedTempFile) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let permissions = match std::fs::metadata(target) {
        Ok(meta) => meta.permissions(),
        Err(_) => std::fs::Permissions::from_mode(0o644),
    };
    staged
        .as_file()
        .set_permissions(permissions)
        .map_err(|e| SyncError::fs(staged.path(), e))
}

#[cfg(not(unix))]
fn keep_permissions(_target: &Path, _staged: &NamedTempFile) -> Result<()> {
    Ok(())
}
