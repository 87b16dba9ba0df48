//! Centralized error types for mxshell.

use std::path::PathBuf;
use thiserror::Error;

use crate::backend::Operation;
use crate::model::kind::MailboxKind;

/// All errors produced by the mxshell library.
#[derive(Error, Debug)]
pub enum MxError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Classifying a path failed (stat or open error), as opposed to a
    /// successful "not a mailbox" verdict.
    #[error("Cannot determine mailbox type of '{path}': {source}")]
    Detection {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The path exists but is not a mailbox of any known kind.
    #[error("{0} is not a mailbox")]
    NotAMailbox(PathBuf),

    /// Bounded lock retries were exhausted.
    #[error("Timeout exceeded while locking '{path}' after {attempts} attempt(s)")]
    LockTimeout { path: PathBuf, attempts: u32 },

    /// The lock could not be taken for a reason other than contention.
    #[error("Cannot lock '{path}': {source}")]
    LockDenied {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The operation has no implementation for this mailbox kind.
    #[error("{op} is not supported for {kind} mailboxes")]
    Unsupported { kind: MailboxKind, op: Operation },

    /// A backend reported a failure of its own.
    #[error("{kind} backend failed on '{path}': {reason}")]
    Backend {
        kind: MailboxKind,
        path: PathBuf,
        reason: String,
    },

    /// The user declined at a confirmation point.
    #[error("Operation aborted by user")]
    UserAborted,

    /// Index-table growth arithmetic would wrap.
    #[error("Integer overflow -- can't allocate memory")]
    IntegerOverflow,

    /// The session was opened read-only.
    #[error("Mailbox '{0}' is read-only")]
    ReadOnly(PathBuf),

    /// Writes were disabled on an otherwise writable session.
    #[error("Mailbox '{0}' is marked unwritable")]
    Unwritable(PathBuf),

    /// The mailbox changed on disk underneath an open session.
    #[error("Mailbox '{0}' was modified externally")]
    Modified(PathBuf),

    /// The message handle is not valid for the requested operation.
    #[error("Invalid message handle: {0}")]
    BadHandle(String),

    /// The session has already been closed.
    #[error("Mailbox session is not open")]
    NotOpen,

    /// An invalid path was provided.
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Convenience alias for `Result<T, MxError>`.
pub type Result<T> = std::result::Result<T, MxError>;

impl MxError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a `Backend` variant.
    pub fn backend(kind: MailboxKind, path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Backend {
            kind,
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Only integer overflow during table growth must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IntegerOverflow)
    }

    /// Lock contention and lock denial abort a single I/O step; the caller
    /// may retry at a higher level.
    pub fn is_lock_error(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::LockDenied { .. })
    }
}

/// Allow `?` on `std::io::Error` inside functions returning `MxError`
/// when no path context is available (rare, prefer `MxError::io`).
impl From<std::io::Error> for MxError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
