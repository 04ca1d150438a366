//! Cross-process exclusive locks over named files.
//!
//! Locks are advisory `flock`-style locks taken on a dedicated lock file.
//! Each acquisition opens its own file handle, so two threads of the same
//! process contend exactly like two separate processes do.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::{tlog_trace, Error, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// A held lock. Releasing is idempotent and also happens on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl LockGuard {
    /// Release the lock. Calling this on an already released guard is a no-op.
    pub fn release(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            FileExt::unlock(&file)?;
            tlog_trace!("lock released: {}", self.path.display());
        }
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Acquires exclusive locks, optionally with a bounded wait.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockManager {
    timeout: Option<Duration>,
}

impl LockManager {
    /// A manager whose `acquire` blocks until the lock is free.
    pub fn new() -> Self {
        Self { timeout: None }
    }

    /// A manager whose `acquire` gives up with `Error::LockTimeout`.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Block until the lock at `path` is held.
    ///
    /// Creates the lock file and its parent directories when absent.
    pub fn acquire(&self, path: &Path) -> Result<LockGuard> {
        let Some(timeout) = self.timeout else {
            let file = open_lock_file(path)?;
            FileExt::lock_exclusive(&file)?;
            tlog_trace!("lock acquired: {}", path.display());
            return Ok(LockGuard {
                file: Some(file),
                path: path.to_path_buf(),
            });
        };

        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if let Some(guard) = self.try_acquire(path)? {
                return Ok(guard);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Take the lock if it is free, otherwise return `None` immediately.
    pub fn try_acquire(&self, path: &Path) -> Result<Option<LockGuard>> {
        let file = open_lock_file(path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tlog_trace!("lock acquired (try): {}", path.display());
                Ok(Some(LockGuard {
                    file: Some(file),
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Run `f` while holding the lock at `path`.
    ///
    /// The lock is released before returning on every path, including when
    /// `f` fails or panics.
    pub fn with_lock<R>(&self, path: &Path, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let mut guard = self.acquire(path)?;
        let result = f();
        let released = guard.release();
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
