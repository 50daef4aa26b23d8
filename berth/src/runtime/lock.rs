//! Build lock.
//!
//! Uses file locking (flock) so builds sharing a BERTH_HOME directory run one
//! after another when they write layers and move tags.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use berth_shared::errors::{BerthError, BerthResult};

/// A lock guard that holds an exclusive lock on the build lock file.
///
/// The lock is automatically released when this guard is dropped,
/// or when the process exits/crashes.
#[derive(Debug)]
pub struct BuildLock {
    file: File,
    path: PathBuf,
}

impl BuildLock {
    /// Acquire the build lock, waiting for any build that holds it.
    ///
    /// Blocks the calling thread; async callers go through `run_blocking`.
    pub fn acquire(lock_path: &Path) -> BerthResult<Self> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BerthError::Storage(format!("failed to create locks dir: {}", e)))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| BerthError::Storage(format!("failed to open lock file: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let fd = file.as_raw_fd();
            if !try_flock(fd, libc::LOCK_EX | libc::LOCK_NB)? {
                tracing::info!(lock_path = %lock_path.display(), "Waiting for build lock");
                try_flock(fd, libc::LOCK_EX)?;
            }
        }

        tracing::debug!(lock_path = %lock_path.display(), "Acquired build lock");

        Ok(BuildLock {
            file,
            path: lock_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Returns `false` when a non-blocking request finds the lock held.
#[cfg(unix)]
fn try_flock(fd: std::os::unix::io::RawFd, operation: libc::c_int) -> BerthResult<bool> {
    loop {
        let result = unsafe { libc::flock(fd, operation) };
        if result == 0 {
            return Ok(true);
        }

        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::Interrupted => continue,
            std::io::ErrorKind::WouldBlock => return Ok(false),
            _ => {
                return Err(BerthError::Storage(format!(
                    "failed to acquire lock: {}",
                    err
                )));
            }
        }
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = self.file.as_raw_fd();
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
            }
        }

        tracing::debug!(lock_path = %self.path.display(), "Released build lock");
    }
}
