//! Whole-directory snapshots used to bootstrap new clients.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Result, SyncError};
use crate::paths;
use crate::protocol::{Header, MessageType};
use crate::tree::INCOMING_PREFIX;
use crate::wire::WireCodec;

/// Name prefix of temporary archives.
pub const SNAPSHOT_PREFIX: &str = ".dirsync-snapshot-";

/// Temporary archives and half-received files belong to dirsync itself and
/// are never archived or watched.
pub fn is_sync_artifact(name: &str) -> bool {
    name.starts_with(SNAPSHOT_PREFIX) || name.starts_with(INCOMING_PREFIX)
}

/// Packs a directory into an archive file and back. Both calls block.
pub trait Archiver: Send + Sync {
    fn pack(&self, root: &Path, archive: &Path) -> Result<()>;
    fn unpack(&self, archive: &Path, dest: &Path) -> Result<()>;
}

/// Zip archives built in-process.
#[derive(Debug, Clone, Default)]
pub struct ZipArchiver {
    ignore: Vec<String>,
}

impl ZipArchiver {
    pub fn new(ignore: Vec<String>) -> Self {
        Self { ignore }
    }

    fn skip(&self, name: &str) -> bool {
        is_sync_artifact(name) || self.ignore.iter().any(|i| i == name)
    }
}

impl Archiver for ZipArchiver {
    fn pack(&self, root: &Path, archive: &Path) -> Result<()> {
        let file = File::create(archive).map_err(|e| SyncError::fs(archive, e))?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let walker = WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| match entry.file_name().to_str() {
                Some(name) => !self.skip(name),
                None => {
                    warn!("Not archiving {:?}: its name is not valid UTF-8", entry.path());
                    false
                }
            });

        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            let Some(name) = paths::to_wire(root, entry.path()) else {
                continue;
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                zip.add_directory(name, options)?;
            } else if file_type.is_file() {
                let len = entry.metadata().map_err(io::Error::from)?.len();
                zip.start_file(name, options.large_file(len >= u32::MAX as u64))?;
                let mut source =
                    File::open(entry.path()).map_err(|e| SyncError::fs(entry.path(), e))?;
                io::copy(&mut source, &mut zip)?;
            } else {
                debug!("Not archiving special file {:?}", entry.path());
            }
        }

        zip.finish()?.flush()?;
        Ok(())
    }

    fn unpack(&self, archive: &Path, dest: &Path) -> Result<()> {
        let file = File::open(archive).map_err(|e| SyncError::fs(archive, e))?;
        let mut zip = ZipArchive::new(BufReader::new(file))?;

        for index in 0..zip.len() {
            let mut entry = zip.by_index(index)?;
            let Some(relative) = entry.enclosed_name() else {
                warn!("Skipping archive entry with unsafe name {:?}", entry.name());
                continue;
            };
            let target = dest.join(relative);

            if entry.is_dir() {
                std::fs::create_dir_all(&target).map_err(|e| SyncError::fs(&target, e))?;
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| SyncError::fs(parent, e))?;
            }
            let mut out = File::create(&target).map_err(|e| SyncError::fs(&target, e))?;
            io::copy(&mut entry, &mut out)?;
        }
        Ok(())
    }
}

/// Delegates to the host archiver: `zip`/`unzip` on POSIX, PowerShell on Windows.
#[derive(Debug, Clone, Default)]
pub struct SystemArchiver {
    ignore: Vec<String>,
}

impl SystemArchiver {
    pub fn new(ignore: Vec<String>) -> Self {
        Self { ignore }
    }

    /// `zip -x` patterns for sync artifacts and ignored names at any depth.
    fn zip_exclusions(&self) -> Vec<String> {
        let mut patterns = Vec::new();
        for prefix in [SNAPSHOT_PREFIX, INCOMING_PREFIX] {
            patterns.push(format!("{prefix}*"));
            patterns.push(format!("*/{prefix}*"));
        }
        for name in &self.ignore {
            patterns.push(name.clone());
            patterns.push(format!("{name}/*"));
            patterns.push(format!("*/{name}"));
            patterns.push(format!("*/{name}/*"));
        }
        patterns
    }

    /// `Get-ChildItem -Exclude` list. It only filters the top level.
    fn powershell_exclusions(&self) -> String {
        [format!("{SNAPSHOT_PREFIX}*"), format!("{INCOMING_PREFIX}*")]
            .iter()
            .chain(self.ignore.iter())
            .map(|name| powershell_quote(name))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn run(mut command: Command) -> Result<()> {
        debug!("Running {:?}", command);
        let output = command
            .output()
            .map_err(|e| SyncError::Archiver(format!("failed to launch {command:?}: {e}")))?;
        if !output.status.success() {
            return Err(SyncError::Archiver(format!(
                "{:?} exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl Archiver for SystemArchiver {
    fn pack(&self, root: &Path, archive: &Path) -> Result<()> {
        // zip runs inside `root`, so the archive path must not be relative.
        let archive = if archive.is_absolute() {
            archive.to_path_buf()
        } else {
            std::env::current_dir()?.join(archive)
        };
        // zip refuses to update an empty placeholder file.
        match std::fs::remove_file(&archive) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SyncError::fs(&archive, e)),
        }

        let command = if cfg!(windows) {
            let mut command = Command::new("powershell");
            command.arg("-NoProfile").arg("-Command").arg(format!(
                "Get-ChildItem -Path {} -Force -Exclude {} | Compress-Archive -DestinationPath {} -Force",
                powershell_quote(&root.join("*").display().to_string()),
                self.powershell_exclusions(),
                powershell_quote(&archive.display().to_string())
            ));
            command
        } else {
            let mut command = Command::new("zip");
            command
                .arg("-q")
                .arg("-r")
                .arg(&archive)
                .arg(".")
                .arg("-x")
                .args(self.zip_exclusions())
                .current_dir(root);
            command
        };
        Self::run(command)
    }

    fn unpack(&self, archive: &Path, dest: &Path) -> Result<()> {
        let command = if cfg!(windows) {
            let mut command = Command::new("powershell");
            command.arg("-NoProfile").arg("-Command").arg(format!(
                "Expand-Archive -Path {} -DestinationPath {} -Force",
                powershell_quote(&archive.display().to_string()),
                powershell_quote(&dest.display().to_string())
            ));
            command
        } else {
            let mut command = Command::new("unzip");
            command.arg("-o").arg("-q").arg(archive).arg("-d").arg(dest);
            command
        };
        Self::run(command)
    }
}

fn powershell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Sends and receives snapshots over a connection.
#[derive(Clone)]
pub struct SnapshotTransfer {
    codec: WireCodec,
    archiver: Arc<dyn Archiver>,
    scratch_dir: PathBuf,
}

impl SnapshotTransfer {
    pub fn new(codec: WireCodec, archiver: Arc<dyn Archiver>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            codec,
            archiver,
            scratch_dir: scratch_dir.into(),
        }
    }

    fn scratch_file(&self) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(SNAPSHOT_PREFIX)
            .suffix(".zip")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| SyncError::fs(&self.scratch_dir, e))
    }

    /// Archives `root` into a temporary file that is removed when dropped.
    pub async fn pack(&self, root: &Path) -> Result<NamedTempFile> {
        let archive = self.scratch_file()?;
        let archiver = self.archiver.clone();
        let root = root.to_path_buf();
        let path = archive.path().to_path_buf();
        tokio::task::spawn_blocking(move || archiver.pack(&root, &path))
            .await
            .map_err(|e| SyncError::Archiver(format!("archiving task failed: {e}")))??;
        Ok(archive)
    }

    /// Announces `archive` with `SEND_SNAPSHOT` and streams it; the archive is
    /// deleted afterwards whether or not the send succeeded.
    pub async fn send_archive<W: AsyncWrite + Unpin>(
        &self,
        conn: &mut W,
        archive: NamedTempFile,
    ) -> Result<u64> {
        let mut file = tokio::fs::File::open(archive.path())
            .await
            .map_err(|e| SyncError::fs(archive.path(), e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| SyncError::fs(archive.path(), e))?
            .len();

        self.codec
            .write_header(conn, Header::new(MessageType::SendSnapshot, len))
            .await?;
        self.codec.send_stream(&mut file, conn, len).await?;
        drop(file);
        archive.close().map_err(SyncError::Io)?;
        Ok(len)
    }

    pub async fn send_snapshot<W: AsyncWrite + Unpin>(&self, conn: &mut W, root: &Path) -> Result<u64> {
        let archive = self.pack(root).await?;
        let len = self.send_archive(conn, archive).await?;
        info!("Sent snapshot of {:?} ({} bytes)", root, len);
        Ok(len)
    }

    /// Receives a full snapshot and extracts it over `dest_root`.
    ///
    /// Nothing is extracted unless the whole archive arrived.
    pub async fn receive_snapshot<R: AsyncRead + Unpin>(
        &self,
        conn: &mut R,
        dest_root: &Path,
    ) -> Result<u64> {
        let header = self
            .codec
            .read_message(conn)
            .await
            .map_err(|e| e.into_transfer("snapshot header"))?
            .ok_or_else(|| SyncError::Transfer("connection closed before the snapshot".into()))?;

        match header.kind {
            MessageType::SendSnapshot => {}
            MessageType::ErrorResponse => {
                return Err(SyncError::Protocol(
                    "server refused the snapshot request".into(),
                ))
            }
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected SEND_SNAPSHOT, got {other}"
                )))
            }
        }

        let archive = self.scratch_file()?;
        let mut file = tokio::fs::File::create(archive.path())
            .await
            .map_err(|e| SyncError::fs(archive.path(), e))?;
        self.codec
            .receive_stream(conn, &mut file, header.payload_size)
            .await
            .map_err(|e| e.into_transfer("snapshot"))?;
        file.shutdown().await?;
        drop(file);

        tokio::fs::create_dir_all(dest_root)
            .await
            .map_err(|e| SyncError::fs(dest_root, e))?;

        let archiver = self.archiver.clone();
        let dest = dest_root.to_path_buf();
        let path = archive.path().to_path_buf();
        tokio::task::spawn_blocking(move || archiver.unpack(&path, &dest))
            .await
            .map_err(|e| SyncError::Archiver(format!("extraction task failed: {e}")))??;

        info!(
            "Received snapshot into {:?} ({} bytes)",
            dest_root, header.payload_size
        );
        Ok(header.payload_size)
    }
}
