//! Advisory locking for flat-file mailboxes.
//!
//! A lock combines a whole-file kernel lock (`flock(2)` through `fs2`)
//! with an optional cooperative `.lock` sentinel. Either both are held or
//! neither is: a sentinel failure releases the kernel lock before the
//! error is returned.

pub mod dotlock;

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::error::{MxError, Result};
use crate::prompt::Prompt;

pub use dotlock::{dotlock_file, dotlock_path, undotlock_file};

/// Contention rounds before a lock attempt gives up.
pub const MAX_LOCK_ATTEMPTS: u32 = 5;

/// Tunables for the lock protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// Take the kernel lock at all.
    pub kernel: bool,
    /// Contention rounds allowed when retrying.
    pub attempts: u32,
    /// Delay between two polls.
    pub poll_interval: Duration,
    /// Sentinels older than this are offered for removal.
    pub stale_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            kernel: true,
            attempts: MAX_LOCK_ATTEMPTS,
            poll_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// What a caller asks of [`lock_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockRequest {
    /// Write lock instead of a shared read lock.
    pub exclusive: bool,
    /// Also take the cooperative sentinel.
    pub dotlock: bool,
    /// Poll on contention instead of failing at once.
    pub retry: bool,
}

impl LockRequest {
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::default()
        }
    }

    pub fn shared() -> Self {
        Self::default()
    }

    pub fn with_dotlock(mut self, dotlock: bool) -> Self {
        self.dotlock = dotlock;
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }
}

/// Lock `file` (opened from `path`) according to `request`.
///
/// On failure nothing stays held.
pub fn lock_file(
    path: &Path,
    file: &File,
    request: LockRequest,
    settings: &LockSettings,
    prompt: &mut dyn Prompt,
) -> Result<()> {
    if settings.kernel {
        kernel_lock(path, file, request.exclusive, request.retry, settings)?;
    }

    if request.dotlock {
        if let Err(e) = dotlock_file(path, request.retry, settings, prompt) {
            if settings.kernel {
                let _ = FileExt::unlock(file);
            }
            return Err(e);
        }
    }

    debug!(
        path = %path.display(),
        exclusive = request.exclusive,
        dotlock = request.dotlock,
        "Lock acquired"
    );
    Ok(())
}

/// Release both lock mechanisms. Individual failures are ignored.
pub fn unlock_file(path: &Path, file: &File, dotlock: bool) {
    if let Err(e) = FileExt::unlock(file) {
        debug!(path = %path.display(), error = %e, "Kernel unlock failed");
    }
    if dotlock {
        undotlock_file(path);
    }
}

fn kernel_lock(
    path: &Path,
    file: &File,
    exclusive: bool,
    retry: bool,
    settings: &LockSettings,
) -> Result<()> {
    let limit = if retry { settings.attempts } else { 0 };
    let mut count: u32 = 0;
    let mut attempt: u32 = 0;
    let mut prev_size: Option<u64> = None;

    loop {
        let outcome = if exclusive {
            FileExt::try_lock_exclusive(file)
        } else {
            FileExt::try_lock_shared(file)
        };
        match outcome {
            Ok(()) => return Ok(()),
            Err(e) if is_contended(&e) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Kernel lock denied");
                return Err(MxError::LockDenied {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        }

        // A growing or shrinking file means the holder is making progress.
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        if prev_size.is_some_and(|prev| prev != size) {
            count = 0;
        } else {
            count += 1;
        }
        prev_size = Some(size);
        attempt += 1;

        if count > limit {
            warn!(path = %path.display(), attempts = attempt, "Timeout exceeded while attempting lock");
            return Err(MxError::LockTimeout {
                path: path.to_path_buf(),
                attempts: attempt,
            });
        }

        info!(path = %path.display(), attempt, "Waiting for lock... {attempt}");
        std::thread::sleep(settings.poll_interval);
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || (e.raw_os_error().is_some()
            && e.raw_os_error() == fs2::lock_contended_error().raw_os_error())
}

/// A held lock, released on drop.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    file: File,
    exclusive: bool,
    dotlock: bool,
    released: bool,
}

impl LockHandle {
    /// Lock `file` and keep a duplicate descriptor for the release.
    pub fn acquire(
        path: &Path,
        file: &File,
        request: LockRequest,
        settings: &LockSettings,
        prompt: &mut dyn Prompt,
    ) -> Result<Self> {
        let dup = file.try_clone().map_err(|e| MxError::io(path, e))?;
        lock_file(path, &dup, request, settings, prompt)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: dup,
            exclusive: request.exclusive,
            dotlock: request.dotlock,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Release now instead of at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            unlock_file(&self.path, &self.file, self.dotlock);
            self.released = true;
            debug!(path = %self.path.display(), "Lock released");
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}
