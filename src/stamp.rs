//! Access/modification time snapshots.
//!
//! New-mail detection elsewhere in a mail client compares a mailbox's
//! access and modification times, so merely looking at a mailbox must be
//! able to put both back exactly as they were.

use std::fs::{File, FileTimes};
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::error::{MxError, Result};

/// Access and modification time of a path at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub size: u64,
}

impl FileStamp {
    /// Snapshot the current times of `path`.
    pub fn capture(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|e| MxError::io(path, e))?;
        Ok(Self::from_metadata(&meta))
    }

    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self {
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: meta.len(),
        }
    }

    /// Write both times back to `path`.
    pub fn restore(&self, path: &Path) -> Result<()> {
        set_times(path, self.atime, self.mtime)
    }
}

/// Set the access and modification time of `path` (file or directory).
pub fn set_times(path: &Path, atime: SystemTime, mtime: SystemTime) -> Result<()> {
    let file = File::open(path).map_err(|e| MxError::io(path, e))?;
    file.set_times(FileTimes::new().set_accessed(atime).set_modified(mtime))
        .map_err(|e| MxError::io(path, e))?;
    debug!(path = %path.display(), "Restored file times");
    Ok(())
}

/// Mark a flat-file mailbox as read without touching its content.
///
/// The access time becomes "now". When the mailbox still holds new
/// messages the access time is pulled just below the modification time,
/// so a later check keeps reporting new mail.
pub fn reset_atime(path: &Path, has_new: bool) -> Result<()> {
    let current = FileStamp::capture(path)?;
    let mut atime = SystemTime::now();
    if has_new && atime >= current.mtime {
        atime = current
            .mtime
            .checked_sub(Duration::from_secs(1))
            .unwrap_or(SystemTime::UNIX_EPOCH);
    }
    set_times(path, atime, current.mtime)
}
