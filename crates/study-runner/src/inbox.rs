//! Inbox listing, lock-guarded moves and sentinel acknowledgement.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use study_core::layout::{rename_lock_path, STUDY_FILE_EXTENSION};
use study_core::{ensure_dir, FileLock, LockError};
use tracing::info;
use walkdir::WalkDir;

fn is_study_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(STUDY_FILE_EXTENSION)
}

/// Study files waiting in `inbox`, in name order. The inbox may be a single
/// file or a flat directory; a missing inbox is empty.
pub fn list_requests(inbox: &Path) -> Result<Vec<PathBuf>> {
    if inbox.is_file() {
        return Ok(if is_study_file(inbox) {
            vec![inbox.to_path_buf()]
        } else {
            Vec::new()
        });
    }
    if !inbox.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(inbox).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed listing inbox {}", inbox.display()))?;
        if entry.file_type().is_file() && is_study_file(entry.path()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Moves `src` into `dest_dir` while holding `<src>.lock`.
pub fn move_with_lock(src: &Path, dest_dir: &Path, timeout: Duration) -> Result<PathBuf> {
    let name = src
        .file_name()
        .ok_or_else(|| anyhow!("cannot move {}: no file name", src.display()))?;
    ensure_dir(dest_dir)?;
    let dest = dest_dir.join(name);
    let lock_path = rename_lock_path(src);
    {
        let _guard = FileLock::acquire(&lock_path, timeout)?;
        fs::rename(src, &dest)
            .with_context(|| format!("failed moving {} to {}", src.display(), dest.display()))?;
    }
    let _ = fs::remove_file(&lock_path);
    Ok(dest)
}

pub fn sentinel_present(path: &Path) -> bool {
    path.exists()
}

/// Creates the sentinel file if it is not already there.
pub fn raise_sentinel(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed creating sentinel {}", path.display()))?;
    Ok(())
}

/// Runs `action` under an exclusive lock on the sentinel, then removes it.
/// Returns `Ok(false)` when the sentinel vanished before it could be taken.
pub fn acknowledge_sentinel<F>(path: &Path, timeout: Duration, action: F) -> Result<bool, LockError>
where
    F: FnOnce(),
{
    if !path.exists() {
        return Ok(false);
    }
    let guard = FileLock::acquire(path, timeout)?;
    action();
    if let Err(source) = fs::remove_file(guard.path()) {
        if source.kind() != std::io::ErrorKind::NotFound {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    info!(sentinel = %path.display(), "sentinel acknowledged");
    Ok(true)
}
