//! Cooperative `.lock` sentinel files.
//!
//! Works across hosts and with programs that ignore kernel locks, as long
//! as they follow the same convention: whoever creates `<mailbox>.lock`
//! exclusively owns the mailbox until the file is removed.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::error::{MxError, Result};
use crate::i18n;
use crate::lock::LockSettings;
use crate::prompt::{Answer, Prompt};

/// Sentinel path for a mailbox.
pub fn dotlock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Create the sentinel for `path`.
///
/// On contention the sentinel is polled; once the attempt budget is spent
/// or the sentinel is older than `stale_after`, the user is offered to
/// break it (once). Without `retry` the first contention fails.
pub fn dotlock_file(
    path: &Path,
    retry: bool,
    settings: &LockSettings,
    prompt: &mut dyn Prompt,
) -> Result<()> {
    let lock_path = dotlock_path(path);
    let limit = if retry { settings.attempts } else { 0 };
    let mut count: u32 = 0;
    let mut forced = false;

    loop {
        match create_sentinel(&lock_path) {
            Ok(()) => {
                debug!(path = %lock_path.display(), "Dot-lock acquired");
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(MxError::LockDenied {
                    path: lock_path,
                    source: e,
                })
            }
        }

        count += 1;
        let stale = sentinel_age(&lock_path).is_some_and(|age| age >= settings.stale_after);
        if stale || count > limit {
            if retry && !forced {
                let question = i18n::ask_remove_lock(&path.display().to_string());
                if prompt.confirm(&question, Answer::Yes) == Answer::Yes {
                    warn!(path = %lock_path.display(), "Breaking foreign dot-lock");
                    remove_sentinel(&lock_path);
                    forced = true;
                    count = 0;
                    continue;
                }
            }
            warn!(path = %path.display(), "Can't dotlock");
            return Err(MxError::LockTimeout {
                path: path.to_path_buf(),
                attempts: count,
            });
        }

        info!(path = %path.display(), attempt = count, "Waiting for dot-lock...");
        std::thread::sleep(settings.poll_interval);
    }
}

/// Remove the sentinel for `path`. Missing sentinels are ignored.
pub fn undotlock_file(path: &Path) {
    remove_sentinel(&dotlock_path(path));
}

fn create_sentinel(lock_path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    writeln!(file, "{}@{}", std::process::id(), host)?;
    Ok(())
}

fn sentinel_age(lock_path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(lock_path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn remove_sentinel(lock_path: &Path) {
    if let Err(e) = std::fs::remove_file(lock_path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %lock_path.display(), error = %e, "Could not remove dot-lock");
        }
    }
}
