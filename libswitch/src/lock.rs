//! Per-product advisory lock.
//!
//! Mutating operations hold an exclusive `flock(2)` on
//! `<storage_root>/<product>/.lock` so that concurrent invocations against the
//! same product run one after another. The lock is released when the guard is
//! dropped.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::{Result, SwitchError};

#[derive(Debug)]
pub struct ProductLock {
    _flock: Flock<File>,
    path: PathBuf,
}

impl ProductLock {
    /// Block until the lock at `path` is held.
    pub fn acquire(path: &Path) -> Result<Self> {
        Self::lock(path, FlockArg::LockExclusive)
    }

    /// Take the lock only if nobody else holds it.
    pub fn try_acquire(path: &Path) -> Result<Self> {
        Self::lock(path, FlockArg::LockExclusiveNonblock)
    }

    fn lock(path: &Path, arg: FlockArg) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(SwitchError::io(path))?;
        let flock = Flock::lock(file, arg).map_err(|(_, errno)| SwitchError::Lock {
            path: path.to_path_buf(),
            reason: errno.to_string(),
        })?;
        debug!(path = %path.display(), "product lock acquired");
        Ok(Self {
            _flock: flock,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
