//! Filesystem and path helpers
//!
//! ## File Operations
//! - Atomic writes through a temporary file in the destination directory
//! - Millisecond mtime reads and writes
//! - Pruning directories left empty after deletions
//!
//! ## Path Mapping
//! - Vault-relative, slash-separated paths as used in remote documents
//! - Rejection of paths that would escape the vault
//!
//! ## Display
//! - Human-readable byte sizes

use crate::error::{Result, SyncError};
use filetime::FileTime;
use std::fs::{self, Metadata};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Write `content` to `path` without ever exposing a partial file
///
/// The content goes to a temporary file next to the destination, which is
/// then renamed over it. Missing parent directories are created.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".vaultsync-")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| SyncError::Io(e.error))?;

    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Milliseconds since the Unix epoch; times before it clamp to zero
pub fn system_time_to_ms(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// `(mtime, ctime)` of a file in milliseconds
///
/// Creation time is not available everywhere; mtime stands in for it then.
pub fn file_times_ms(metadata: &Metadata) -> Result<(i64, i64)> {
    let mtime = system_time_to_ms(metadata.modified()?);
    let ctime = metadata.created().map(system_time_to_ms).unwrap_or(mtime);
    Ok((mtime, ctime))
}

/// Set a file's modification time from milliseconds
pub fn set_file_mtime(path: &Path, mtime_ms: i64) -> Result<()> {
    let secs = mtime_ms.div_euclid(1000);
    let nanos = (mtime_ms.rem_euclid(1000) * 1_000_000) as u32;
    filetime::set_file_mtime(path, FileTime::from_unix_time(secs, nanos))?;
    trace!("Set mtime of {:?} to {}", path, mtime_ms);
    Ok(())
}

/// Remove a directory if it has no entries
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Walk up from a deleted file's directory removing empty directories
///
/// Stops at the first non-empty directory and never removes `root` itself.
/// Returns how many directories were removed.
pub fn remove_empty_parents(file: &Path, root: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut current = file.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if !remove_dir_if_empty(dir)? {
            break;
        }
        removed += 1;
        current = dir.parent();
    }
    Ok(removed)
}

/// Strip `base` from `path`
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    path.strip_prefix(base)
        .map(Path::to_path_buf)
        .map_err(|_| SyncError::InvalidPath(format!("{:?} is not inside {:?}", path, base)))
}

/// Slash-separated vault path for a relative filesystem path
pub fn to_vault_path(relative: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| SyncError::InvalidPath(format!("{:?} is not valid UTF-8", relative)))?,
            ),
            Component::CurDir => {}
            _ => return Err(SyncError::InvalidPath(format!("{:?} is not a plain relative path", relative))),
        }
    }
    if parts.is_empty() {
        return Err(SyncError::InvalidPath("empty path".to_string()));
    }
    Ok(parts.join("/"))
}

/// Absolute location of a vault path under `root`
///
/// Remote paths are untrusted: absolute paths, `..` segments and empty
/// paths are rejected so a document can never write outside the vault.
pub fn vault_path_to_abs(root: &Path, vault_path: &str) -> Result<PathBuf> {
    let trimmed = vault_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(SyncError::InvalidPath(format!("empty path {:?}", vault_path)));
    }
    let mut abs = root.to_path_buf();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(SyncError::InvalidPath(format!("{} escapes the vault", vault_path))),
            s if s.contains('\\') || s.contains('\0') => {
                return Err(SyncError::InvalidPath(format!("{} contains a forbidden character", vault_path)))
            }
            s => abs.push(s),
        }
    }
    if abs == root {
        return Err(SyncError::InvalidPath(format!("empty path {:?}", vault_path)));
    }
    Ok(abs)
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
