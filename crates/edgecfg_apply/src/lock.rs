//! Single-instance lock.
//!
//! An exclusive, non-blocking `flock` on a well-known path. A second run
//! never waits: it gets `None` and exits with the "already running" code.

use crate::error::LockError;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Held for the lifetime of the run; released on drop
#[derive(Debug)]
pub struct AppLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl AppLock {
    /// Try to take the lock. `Ok(None)` when another process holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_err)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!("acquired lock {}", path.display());
                Ok(Some(Self {
                    _lock: lock,
                    path: path.to_path_buf(),
                }))
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(io_err(std::io::Error::from(errno))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
