//! Format backends behind one capability interface.
//!
//! Each mailbox kind is served by a [`Backend`]. A session owns one
//! backend instance for its whole life, created by the stateless
//! [`Registry`]. Operations a backend does not implement fail with
//! [`MxError::Unsupported`] instead of being absent.

pub mod maildir;
pub mod mbox;
pub mod message;
pub mod mh;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::{MxError, Result};
use crate::lock::{LockRequest, LockSettings};
use crate::model::kind::MailboxKind;
use crate::prompt::Prompt;
use crate::session::Mailbox;

pub use message::{HandleFlags, HandleState, Message};

/// The operations a backend may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Open,
    OpenAppend,
    OpenNewMessage,
    OpenMessage,
    CommitMessage,
    CloseMessage,
    CheckNew,
    Sync,
    Close,
    CheckEmpty,
    Catchup,
    FastCopy,
    Access,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::OpenAppend => "open-append",
            Self::OpenNewMessage => "open-new-message",
            Self::OpenMessage => "open-message",
            Self::CommitMessage => "commit-message",
            Self::CloseMessage => "close-message",
            Self::CheckNew => "check-new",
            Self::Sync => "sync",
            Self::Close => "close",
            Self::CheckEmpty => "check-empty",
            Self::Catchup => "catchup",
            Self::FastCopy => "fast-copy",
            Self::Access => "access",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of scanning a mailbox on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Every message was read.
    Complete,
    /// Reading stopped early; what was read is indexed.
    Interrupted,
}

/// Result of a check for new mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Unchanged,
    /// Messages were appended and indexed.
    NewMail,
    /// The mailbox changed in place and the index was rebuilt.
    Reopened,
}

/// Result of a server-side copy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastCopy {
    Done,
    /// Not possible here; the caller copies message by message.
    Fallback,
}

/// What a new message handle starts out with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub flags: HandleFlags,
    pub received: DateTime<Utc>,
    /// Envelope line to write first, for flat-file targets.
    pub from_line: Option<String>,
}

/// Runtime context handed to backend operations.
pub struct Cx<'a> {
    pub config: &'a Config,
    pub prompt: &'a mut dyn Prompt,
    /// Raised from outside to stop a long scan early.
    pub interrupt: &'a AtomicBool,
}

impl Cx<'_> {
    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    pub fn lock_settings(&self) -> LockSettings {
        self.config.lock_settings()
    }

    /// Lock taken while reading a shared file.
    pub fn read_lock(&self) -> LockRequest {
        LockRequest::shared().with_retry(true)
    }

    /// Lock taken while writing a shared file.
    pub fn write_lock(&self) -> LockRequest {
        LockRequest::exclusive()
            .with_dotlock(self.config.lock.dotlock)
            .with_retry(true)
    }
}

fn unsupported<T>(kind: MailboxKind, op: Operation) -> Result<T> {
    Err(MxError::Unsupported { kind, op })
}

/// Per-kind implementation of the mailbox operations.
///
/// Every method receives the session it serves; while it runs, the
/// session's own backend slot is empty.
pub trait Backend {
    /// Kind this backend serves.
    fn kind(&self) -> MailboxKind;

    /// Whether `op` is implemented.
    fn supports(&self, op: Operation) -> bool;

    /// Scan the mailbox into the session's index.
    fn open(&mut self, mb: &mut Mailbox, _cx: &mut Cx<'_>) -> Result<OpenOutcome> {
        unsupported(mb.kind(), Operation::Open)
    }

    /// Prepare for appending. `create` is set when the mailbox does not exist yet.
    fn open_append(&mut self, mb: &mut Mailbox, _cx: &mut Cx<'_>, _create: bool) -> Result<()> {
        unsupported(mb.kind(), Operation::OpenAppend)
    }

    fn open_new_message(&mut self, mb: &mut Mailbox, _new: NewMessage) -> Result<Message> {
        unsupported(mb.kind(), Operation::OpenNewMessage)
    }

    fn open_message(&mut self, mb: &mut Mailbox, _msgno: usize) -> Result<Message> {
        unsupported(mb.kind(), Operation::OpenMessage)
    }

    fn commit_message(&mut self, mb: &mut Mailbox, _msg: &mut Message) -> Result<()> {
        unsupported(mb.kind(), Operation::CommitMessage)
    }

    fn close_message(&mut self, _mb: &mut Mailbox, _msg: &mut Message) -> Result<()> {
        Ok(())
    }

    fn check_new(&mut self, mb: &mut Mailbox, _cx: &mut Cx<'_>) -> Result<CheckOutcome> {
        unsupported(mb.kind(), Operation::CheckNew)
    }

    /// Write flag changes and drop deleted messages from storage.
    ///
    /// Index compaction is left to the caller.
    fn sync(&mut self, mb: &mut Mailbox, _cx: &mut Cx<'_>) -> Result<()> {
        unsupported(mb.kind(), Operation::Sync)
    }

    /// Release everything held for the session. Must not fail.
    fn close(&mut self, _mb: &mut Mailbox) {}

    /// Whether the mailbox at `path` holds no message. Needs no session.
    fn check_empty(&self, _path: &Path) -> Result<bool> {
        unsupported(self.kind(), Operation::CheckEmpty)
    }

    /// Mark everything read on the server (news kinds).
    fn catchup(&mut self, mb: &mut Mailbox, _cx: &mut Cx<'_>) -> Result<()> {
        unsupported(mb.kind(), Operation::Catchup)
    }

    /// Copy the given messages to `target` without downloading them.
    fn fast_copy(
        &mut self,
        _mb: &mut Mailbox,
        _msgnos: &[usize],
        _target: &Path,
        _cx: &mut Cx<'_>,
    ) -> Result<FastCopy> {
        Ok(FastCopy::Fallback)
    }

    /// Whether the mailbox behind `path` may be read (or written, with
    /// `write`). Local kinds are answered by the filesystem instead.
    fn access(&self, _path: &str, _write: bool) -> Result<bool> {
        unsupported(self.kind(), Operation::Access)
    }

    /// The backend keeps deleted flags itself and purges during its own
    /// sync, reconciling the index on its own.
    fn folds_purge(&self) -> bool {
        false
    }
}

/// Creates a fresh backend for one session.
pub type BackendFactory = Box<dyn Fn() -> Box<dyn Backend>>;

/// Maps each kind to the factory of its backend.
pub struct Registry {
    factories: HashMap<MailboxKind, BackendFactory>,
}

impl Registry {
    /// A registry without any backend.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// The bundled local backends: mbox, MMDF, MH and maildir.
    ///
    /// Remote and compressed kinds have nothing registered until an
    /// embedder provides one.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(MailboxKind::Mbox, || {
            Box::new(mbox::FlatBackend::new(MailboxKind::Mbox))
        });
        registry.register(MailboxKind::Mmdf, || {
            Box::new(mbox::FlatBackend::new(MailboxKind::Mmdf))
        });
        registry.register(MailboxKind::Maildir, || Box::new(maildir::MaildirBackend::new()));
        registry.register(MailboxKind::Mh, || Box::new(mh::MhBackend::new()));
        registry
    }

    /// Register (or replace) the backend for `kind`.
    pub fn register<F>(&mut self, kind: MailboxKind, factory: F)
    where
        F: Fn() -> Box<dyn Backend> + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    pub fn contains(&self, kind: MailboxKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// A new backend instance for `kind`, if one is registered.
    pub fn create(&self, kind: MailboxKind) -> Option<Box<dyn Backend>> {
        self.factories.get(&kind).map(|factory| factory())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
