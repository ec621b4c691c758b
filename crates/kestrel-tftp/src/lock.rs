//! Advisory file locking
//!
//! Readers take a shared lock and writers an exclusive one for the whole
//! transfer, so a download never observes a half-written upload of the same
//! file. Locks are advisory: they only coordinate processes that also lock.
//!
//! The backend sits behind [`FileLock`] so platforms without `flock(2)` (or
//! callers that disable locking) get [`NoLock`] instead.

use std::fs::File;
use std::io;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{Result, TftpError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

pub trait FileLock: Send + Sync + std::fmt::Debug {
    /// Lock `file`. A non-blocking attempt on a held lock fails with
    /// [`io::ErrorKind::WouldBlock`].
    fn lock(&self, file: &File, mode: LockMode, blocking: bool) -> io::Result<()>;

    fn unlock(&self, file: &File) -> io::Result<()>;
}

/// `flock(2)` on the open file description
#[derive(Debug, Default, Clone, Copy)]
pub struct FlockLock;

#[cfg(unix)]
impl FileLock for FlockLock {
    fn lock(&self, file: &File, mode: LockMode, blocking: bool) -> io::Result<()> {
        let mut operation = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };
        if !blocking {
            operation |= libc::LOCK_NB;
        }
        flock(file, operation)
    }

    fn unlock(&self, file: &File) -> io::Result<()> {
        flock(file, libc::LOCK_UN)
    }
}

#[cfg(unix)]
fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
impl FileLock for FlockLock {
    fn lock(&self, _file: &File, _mode: LockMode, _blocking: bool) -> io::Result<()> {
        Ok(())
    }

    fn unlock(&self, _file: &File) -> io::Result<()> {
        Ok(())
    }
}

/// Locking disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLock;

impl FileLock for NoLock {
    fn lock(&self, _file: &File, _mode: LockMode, _blocking: bool) -> io::Result<()> {
        Ok(())
    }

    fn unlock(&self, _file: &File) -> io::Result<()> {
        Ok(())
    }
}

/// Best available backend for this platform
pub fn platform_lock() -> Arc<dyn FileLock> {
    if cfg!(unix) {
        Arc::new(FlockLock)
    } else {
        Arc::new(NoLock)
    }
}

/// Pick the backend for a `flock` on/off setting
pub fn lock_backend(enabled: bool) -> Arc<dyn FileLock> {
    if enabled { platform_lock() } else { Arc::new(NoLock) }
}

/// Held lock; released when dropped
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    backend: Arc<dyn FileLock>,
    mode: LockMode,
}

impl LockGuard {
    /// Take the lock on `file`.
    ///
    /// A blocking wait runs on the blocking thread pool. A non-blocking
    /// attempt against a held lock returns [`TftpError::FileLocked`].
    pub async fn acquire(
        backend: Arc<dyn FileLock>,
        file: &File,
        mode: LockMode,
        blocking: bool,
        path: &str,
    ) -> Result<Self> {
        let handle = file.try_clone()?;

        let handle = if blocking {
            let backend = Arc::clone(&backend);
            tokio::task::spawn_blocking(move || {
                backend.lock(&handle, mode, true).map(|()| handle)
            })
            .await
            .map_err(|e| TftpError::Other(e.into()))?
        } else {
            backend.lock(&handle, mode, false).map(|()| handle)
        };

        match handle {
            Ok(file) => {
                debug!(path = %path, ?mode, "Lock acquired");
                Ok(Self {
                    file,
                    backend,
                    mode,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(TftpError::FileLocked(path.to_string()))
            }
            Err(e) => Err(TftpError::from_io(e, path)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.backend.unlock(&self.file) {
            Ok(()) => trace!(mode = ?self.mode, "Lock released"),
            Err(e) => debug!(mode = ?self.mode, "Failed to release file lock: {}", e),
        }
    }
}
