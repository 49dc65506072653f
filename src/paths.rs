use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::error::{Result, SyncError};

/// Renders a path relative to `root` in wire form (`/`-separated).
///
/// Returns `None` for paths outside `root`, for `root` itself and for names
/// that are not valid UTF-8. The last are skipped rather than renamed.
pub fn to_wire(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            let Some(part) = part.to_str() else {
                warn!("Skipping {:?}: its name is not valid UTF-8", path);
                return None;
            };
            parts.push(part);
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Maps a wire path back under `root`, rejecting anything that could escape it.
pub fn resolve(root: &Path, wire: &str) -> Result<PathBuf> {
    if wire.starts_with(['/', '\\']) {
        return Err(SyncError::Protocol(format!("path {wire:?} is absolute")));
    }
    let mut resolved = root.to_path_buf();
    let mut depth = 0;
    for part in wire.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(SyncError::Protocol(format!(
                    "path {wire:?} escapes the synchronized directory"
                )))
            }
            part if part.contains(':') && cfg!(windows) => {
                return Err(SyncError::Protocol(format!(
                    "path {wire:?} names a drive or stream"
                )))
            }
            part => {
                resolved.push(part);
                depth += 1;
            }
        }
    }
    if depth == 0 {
        return Err(SyncError::Protocol(format!("path {wire:?} is empty")));
    }
    Ok(resolved)
}

/// True when any component of the wire path is in `ignored`.
pub fn is_ignored(wire: &str, ignored: &[String]) -> bool {
    wire.split('/').any(|part| ignored.iter().any(|i| i == part))
}
