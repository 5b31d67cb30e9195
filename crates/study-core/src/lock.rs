//! Advisory `flock(2)` locks with a bounded acquisition wait.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {timeout:?} waiting for lock {}", path.display())]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("failed opening lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held exclusive lock; released when dropped.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
    _file: File,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct FileLock;

impl FileLock {
    /// Waits up to `timeout` for an exclusive lock on `path`, creating it if needed.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<FileLockGuard, LockError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let deadline = Instant::now() + timeout;
        loop {
            match try_flock_exclusive(&file) {
                Ok(true) => {
                    return Ok(FileLockGuard {
                        path: path.to_path_buf(),
                        _file: file,
                    })
                }
                Ok(false) => {}
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is owned by `file`, which outlives this call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}
