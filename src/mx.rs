//! The mailbox runtime.
//!
//! [`Mx`] carries everything a session needs from its surroundings: the
//! configuration, the backend registry, the compression collaborator, the
//! confirmation prompt and the interrupt flag. It exposes the operations
//! callers use on a mailbox (open, append, check, sync, close) and runs
//! the close pipeline, including relocation of read mail and the copy of
//! deleted mail to the trash.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{CheckOutcome, Cx, FastCopy, OpenOutcome, Operation, Registry};
use crate::config::Config;
use crate::detect::{Compression, Detector, SuffixCompression};
use crate::error::{MxError, Result};
use crate::i18n;
use crate::lock::{LockHandle, LockRequest};
use crate::model::kind::MailboxKind;
use crate::prompt::{Answer, NonInteractive, Prompt};
use crate::session::{Flag, Mailbox, NewMessageOptions, OpenFlags};
use crate::stamp::{self, FileStamp};

/// Message counts reported when a close or sync wrote the mailbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseSummary {
    pub kept: usize,
    pub moved: usize,
    pub deleted: usize,
}

/// How a full close ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Nothing needed saving; the session was torn down.
    Unchanged,
    /// Changes were written and the session was torn down.
    Saved(CloseSummary),
    /// The user declined at a prompt. The session is still open and
    /// nothing was written.
    Aborted,
}

/// How a checkpoint ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Unchanged,
    Synced(CloseSummary),
    /// Every message was purged and the empty file removed; the session
    /// was torn down.
    Removed,
    Aborted,
}

/// Mailbox runtime shared by every session a caller opens.
pub struct Mx<'p> {
    config: Config,
    registry: Registry,
    compression: Option<SuffixCompression>,
    prompt: Box<dyn Prompt + 'p>,
    /// Mailboxes whose new mail has been seen by a full session.
    notified: HashSet<PathBuf>,
    interrupt: Arc<AtomicBool>,
}

impl<'p> Mx<'p> {
    /// A runtime with the bundled backends and the given prompt.
    pub fn new(config: Config, prompt: impl Prompt + 'p) -> Self {
        let compression = (!config.mailbox.compressed_suffixes.is_empty())
            .then(|| SuffixCompression::new(config.mailbox.compressed_suffixes.iter().cloned()));
        Self {
            config,
            registry: Registry::with_defaults(),
            compression,
            prompt: Box::new(prompt),
            notified: HashSet::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A runtime that answers every question with its default.
    pub fn non_interactive(config: Config) -> Self {
        Self::new(config, NonInteractive)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Raise this flag (e.g. from a signal handler) to stop a long scan.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Whether a full session over `path` has acknowledged its new mail.
    pub fn is_notified(&self, path: &Path) -> bool {
        let real = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.notified.contains(&real)
    }

    fn cx(&mut self) -> Cx<'_> {
        Cx {
            config: &self.config,
            prompt: self.prompt.as_mut(),
            interrupt: self.interrupt.as_ref(),
        }
    }

    fn ask(&mut self, policy: crate::prompt::QuadOption, question: &str) -> Answer {
        let answer = policy.query(self.prompt.as_mut(), question);
        debug!(question, ?answer, "Confirmation");
        answer
    }

    // ── Detection ──────────────────────────────────────────────

    /// Classify `path` with the configured default and compression suffixes.
    pub fn classify(&self, path: &Path) -> Result<MailboxKind> {
        Detector::from_config(&self.config)
            .with_compression(self.compression.as_ref().map(|c| c as &dyn Compression))
            .classify(path)
    }

    // ── Open ───────────────────────────────────────────────────

    /// Open a mailbox and index its messages.
    ///
    /// On failure nothing of the session survives.
    pub fn open_mailbox(&mut self, path: &Path, flags: OpenFlags) -> Result<Mailbox> {
        let kind = match self.classify(path)? {
            MailboxKind::Unknown => return Err(MxError::NotAMailbox(path.to_path_buf())),
            kind => kind,
        };
        let ops = self.registry.create(kind).ok_or(MxError::Unsupported {
            kind,
            op: Operation::Open,
        })?;

        let mut mb = Mailbox::new(path, kind, flags);
        mb.maildir_trash = self.config.mailbox.maildir_trash;
        mb.sort_key = self.config.sort_key();
        mb.stamp = FileStamp::capture(path).ok();
        mb.attach(ops);

        if !mb.quiet {
            info!(path = %path.display(), %kind, "{}...", i18n::msg_reading());
        }
        let mut cx = self.cx();
        let outcome = mb.dispatch(Operation::Open, |ops, mb| ops.open(mb, &mut cx));
        match outcome {
            Ok(OpenOutcome::Complete) => {}
            Ok(OpenOutcome::Interrupted) => {
                mb.interrupted = true;
                warn!(path = %path.display(), messages = mb.msg_count(), "{}", i18n::msg_interrupted());
            }
            Err(e) => {
                mb.teardown();
                return Err(e);
            }
        }

        if !mb.no_sort {
            mb.sort();
        }
        debug!(
            path = %path.display(),
            %kind,
            messages = mb.msg_count(),
            readonly = mb.readonly,
            "Mailbox opened"
        );
        Ok(mb)
    }

    /// Open a mailbox for appending, creating it when it does not exist.
    ///
    /// A path that exists but is not a mailbox is never written over.
    pub fn open_append(&mut self, path: &Path, flags: OpenFlags) -> Result<Mailbox> {
        let (kind, create) = match self.classify(path) {
            Ok(MailboxKind::Unknown) => return Err(MxError::NotAMailbox(path.to_path_buf())),
            Ok(kind) => (kind, false),
            Err(MxError::Detection { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                let kind = match &self.compression {
                    Some(c) if c.can_append(path) => MailboxKind::Compressed,
                    _ => self.config.default_kind(),
                };
                (kind, true)
            }
            Err(e) => return Err(e),
        };
        let ops = self.registry.create(kind).ok_or(MxError::Unsupported {
            kind,
            op: Operation::OpenAppend,
        })?;

        let mut mb = Mailbox::new(path, kind, flags);
        mb.append = true;
        mb.attach(ops);

        let mut cx = self.cx();
        if let Err(e) = mb.dispatch(Operation::OpenAppend, |ops, mb| {
            ops.open_append(mb, &mut cx, create)
        }) {
            mb.teardown();
            return Err(e);
        }
        // A newly created directory mailbox has a real path only now.
        if create {
            mb.realpath = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        }
        debug!(path = %path.display(), %kind, create, "Opened for appending");
        Ok(mb)
    }

    // ── Close ──────────────────────────────────────────────────

    /// Release the session without saving anything.
    pub fn fast_close(&mut self, mb: &mut Mailbox) {
        if mb.is_closed() {
            return;
        }
        if !mb.peek {
            self.notified.insert(mb.realpath.clone());
        }
        mb.teardown();
    }

    /// Save pending changes and close the session.
    ///
    /// On [`CloseOutcome::Aborted`] or an error the session stays open and
    /// unchanged on disk.
    pub fn close_mailbox(&mut self, mb: &mut Mailbox) -> Result<CloseOutcome> {
        if mb.is_closed() {
            return Err(MxError::NotOpen);
        }
        mb.closing = true;
        if !mb.is_writable() || mb.append {
            self.fast_close(mb);
            return Ok(CloseOutcome::Unchanged);
        }

        let result = self.close_pipeline(mb);
        if matches!(result, Ok(CloseOutcome::Aborted) | Err(_)) {
            mb.closing = false;
        }
        result
    }

    fn close_pipeline(&mut self, mb: &mut Mailbox) -> Result<CloseOutcome> {
        let policy = self.config.mailbox.clone();

        if mb.kind == MailboxKind::Nntp && mb.counters.unread > 0 && mb.supports(Operation::Catchup) {
            match self.ask(policy.catchup, i18n::q_catchup()) {
                Answer::Abort => return Ok(CloseOutcome::Aborted),
                Answer::Yes => {
                    let mut cx = self.cx();
                    mb.dispatch(Operation::Catchup, |ops, mb| ops.catchup(mb, &mut cx))?;
                }
                Answer::No => {}
            }
        }

        let relocatable: Vec<usize> = mb
            .records
            .iter()
            .filter(|r| r.is_relocatable(policy.keep_flagged))
            .map(|r| r.msgno)
            .collect();

        let mut move_to: Option<PathBuf> = None;
        // News groups are never relocated.
        if !relocatable.is_empty()
            && mb.kind != MailboxKind::Nntp
            && policy.move_read != crate::prompt::QuadOption::No
        {
            let (target, from_spool) = match self.config.find_mbox_hook(&mb.path) {
                Some(hook) => (Some(hook.to_path_buf()), true),
                None => {
                    let inbox = policy.inbox.clone();
                    let from_spool = self.config.is_spool(&mb.path)
                        && !inbox.as_deref().is_some_and(|i| self.config.is_spool(i));
                    (inbox, from_spool)
                }
            };
            if let (true, Some(target)) = (from_spool, target) {
                let question = i18n::ask_move_read(&target.display().to_string());
                match self.ask(policy.move_read, &question) {
                    Answer::Abort => return Ok(CloseOutcome::Aborted),
                    Answer::Yes => move_to = Some(target),
                    Answer::No => {}
                }
            }
        }

        let trash_in_place = mb.kind == MailboxKind::Maildir && mb.maildir_trash;
        let mut purge = true;
        if mb.counters.deleted > 0 && !trash_in_place {
            match self.ask(policy.delete, &i18n::ask_purge(mb.counters.deleted)) {
                Answer::Abort => return Ok(CloseOutcome::Aborted),
                Answer::No => purge = false,
                Answer::Yes => {}
            }
        }

        if policy.mark_old {
            let untouched: Vec<usize> = mb
                .records
                .iter()
                .filter(|r| !r.flags.deleted && !r.flags.old && !r.flags.read)
                .map(|r| r.msgno)
                .collect();
            for msgno in untouched {
                mb.set_flag(msgno, Flag::Old, true)?;
            }
        }

        let moved = match &move_to {
            Some(target) => {
                if !mb.quiet {
                    info!(target = %target.display(), "{}", i18n::moving_to(&target.display().to_string()));
                }
                self.relocate(mb, &relocatable, target)?;
                relocatable.len()
            }
            None => {
                if !mb.counters.changed && mb.counters.deleted == 0 {
                    if !mb.quiet {
                        info!(path = %mb.path.display(), "{}", i18n::msg_unchanged());
                    }
                    if mb.kind.is_flat_file() {
                        let has_new = mb
                            .records
                            .iter()
                            .any(|r| !r.flags.deleted && !r.flags.read && !r.flags.old);
                        if let Err(e) = stamp::reset_atime(&mb.path, has_new) {
                            debug!(path = %mb.path.display(), error = %e, "Could not reset access time");
                        }
                    }
                    self.fast_close(mb);
                    return Ok(CloseOutcome::Unchanged);
                }
                0
            }
        };

        if purge && mb.counters.deleted > 0 && !self.config.is_trash(&mb.path) {
            self.trash_append(mb)?;
        }

        let folds_purge = mb.ops.as_ref().is_some_and(|ops| ops.folds_purge());
        if !purge && !folds_purge {
            clear_deleted(mb);
        }
        let summary = CloseSummary {
            kept: mb.msg_count() - mb.counters.deleted,
            moved,
            deleted: mb.counters.deleted.saturating_sub(moved),
        };
        if folds_purge || mb.counters.changed || mb.counters.deleted > 0 {
            self.sync_backend(mb)?;
        }

        if !mb.quiet {
            info!(
                path = %mb.path.display(),
                kept = summary.kept,
                moved = summary.moved,
                deleted = summary.deleted,
                "{}",
                i18n::close_summary(summary.kept, summary.moved, summary.deleted)
            );
        }

        if self.may_unlink(mb) {
            unlink_empty(&mb.path, &self.config)?;
        }
        self.fast_close(mb);
        Ok(CloseOutcome::Saved(summary))
    }

    /// Move read messages to `target`, marking each copied one for purge.
    fn relocate(&mut self, mb: &mut Mailbox, msgnos: &[usize], target: &Path) -> Result<()> {
        if self.fast_copy(mb, msgnos, target)? == FastCopy::Done {
            for &msgno in msgnos {
                mb.set_flag(msgno, Flag::Delete, true)?;
                mb.set_flag(msgno, Flag::Purge, true)?;
            }
            return Ok(());
        }

        let mut dest = self.open_append(target, OpenFlags::default())?;
        for &msgno in msgnos {
            if let Err(e) = self.append_message(&mut dest, mb, msgno) {
                self.fast_close(&mut dest);
                return Err(e);
            }
            mb.set_flag(msgno, Flag::Delete, true)?;
            mb.set_flag(msgno, Flag::Purge, true)?;
        }
        self.fast_close(&mut dest);
        Ok(())
    }

    fn fast_copy(&mut self, mb: &mut Mailbox, msgnos: &[usize], target: &Path) -> Result<FastCopy> {
        if !mb.supports(Operation::FastCopy) {
            return Ok(FastCopy::Fallback);
        }
        let mut cx = self.cx();
        mb.dispatch(Operation::FastCopy, |ops, mb| {
            ops.fast_copy(mb, msgnos, target, &mut cx)
        })
    }

    /// Copy every deleted message not marked for purge into the trash.
    ///
    /// Nothing is copied when the session's own file is the trash.
    fn trash_append(&mut self, mb: &mut Mailbox) -> Result<()> {
        let Some(trash) = self.config.mailbox.trash.clone() else {
            return Ok(());
        };
        if mb.counters.deleted == 0 || (mb.kind == MailboxKind::Maildir && mb.maildir_trash) {
            return Ok(());
        }
        let doomed: Vec<usize> = mb
            .records
            .iter()
            .filter(|r| r.flags.deleted && !r.flags.purge)
            .map(|r| r.msgno)
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }

        match fs::metadata(&trash) {
            Ok(st) => {
                let own = fs::symlink_metadata(&mb.path).map_err(|e| MxError::io(&mb.path, e))?;
                if st.dev() == own.dev() && st.ino() == own.ino() && !mb.append {
                    debug!(path = %mb.path.display(), "Session is the trash, skipping copy");
                    return Ok(());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(MxError::io(&trash, e)),
        }

        if self.fast_copy(mb, &doomed, &trash)? == FastCopy::Done {
            return Ok(());
        }

        let mut dest = self.open_append(
            &trash,
            OpenFlags {
                quiet: true,
                ..OpenFlags::default()
            },
        )?;
        for msgno in doomed {
            if let Err(e) = self.append_message(&mut dest, mb, msgno) {
                self.fast_close(&mut dest);
                return Err(e);
            }
        }
        self.fast_close(&mut dest);
        debug!(trash = %trash.display(), "Copied deleted messages to trash");
        Ok(())
    }

    fn sync_backend(&mut self, mb: &mut Mailbox) -> Result<()> {
        if !mb.quiet {
            info!(path = %mb.path.display(), "{}...", i18n::msg_writing());
        }
        let mut cx = self.cx();
        mb.dispatch(Operation::Sync, |ops, mb| ops.sync(mb, &mut cx))
    }

    fn may_unlink(&self, mb: &Mailbox) -> bool {
        mb.msg_count() == mb.counters.deleted
            && mb.kind.is_flat_file()
            && !self.config.is_spool(&mb.path)
            && !self.config.mailbox.save_empty
    }

    // ── Checkpoint ─────────────────────────────────────────────

    /// Write pending changes without closing.
    pub fn sync_mailbox(&mut self, mb: &mut Mailbox) -> Result<SyncOutcome> {
        if mb.is_closed() {
            return Err(MxError::NotOpen);
        }
        if mb.dont_write {
            return Err(MxError::Unwritable(mb.path.clone()));
        }
        if mb.readonly {
            return Err(MxError::ReadOnly(mb.path.clone()));
        }
        if !mb.counters.changed && mb.counters.deleted == 0 {
            if !mb.quiet {
                info!(path = %mb.path.display(), "{}", i18n::msg_unchanged());
            }
            return Ok(SyncOutcome::Unchanged);
        }

        let folds_purge = mb.ops.as_ref().is_some_and(|ops| ops.folds_purge());
        let mut purge = true;
        if mb.counters.deleted > 0 {
            let policy = self.config.mailbox.delete;
            match self.ask(policy, &i18n::ask_purge(mb.counters.deleted)) {
                Answer::Abort => return Ok(SyncOutcome::Aborted),
                Answer::No => {
                    purge = false;
                    if !mb.counters.changed {
                        return Ok(SyncOutcome::Unchanged);
                    }
                    if !folds_purge {
                        clear_deleted(mb);
                    }
                }
                Answer::Yes => {
                    if mb
                        .last_tagged()
                        .and_then(|n| mb.record(n))
                        .is_some_and(|r| r.flags.deleted)
                    {
                        mb.last_tag = None;
                    }
                }
            }
        }

        let summary = CloseSummary {
            kept: mb.msg_count() - mb.counters.deleted,
            moved: 0,
            deleted: mb.counters.deleted,
        };
        if purge && mb.counters.deleted > 0 && !self.config.is_trash(&mb.path) {
            self.trash_append(mb)?;
        }

        self.sync_backend(mb)?;
        if !mb.quiet {
            info!(
                path = %mb.path.display(),
                kept = summary.kept,
                deleted = summary.deleted,
                "{}",
                i18n::close_summary(summary.kept, 0, summary.deleted)
            );
        }

        if self.may_unlink(mb) {
            unlink_empty(&mb.path, &self.config)?;
            self.fast_close(mb);
            return Ok(SyncOutcome::Removed);
        }

        // Per-message-file kinds keep their order when nothing was removed.
        if purge || !mb.kind.is_per_message_file() {
            if !folds_purge {
                mb.update_tables(true);
            }
            mb.sort();
        }
        Ok(SyncOutcome::Synced(summary))
    }

    // ── New mail ───────────────────────────────────────────────

    /// Look for mail that arrived (or changes made) since the last scan.
    pub fn check_mailbox(&mut self, mb: &mut Mailbox) -> Result<CheckOutcome> {
        if mb.is_closed() {
            return Err(MxError::NotOpen);
        }
        let mut cx = self.cx();
        let outcome = mb.dispatch(Operation::CheckNew, |ops, mb| ops.check_new(mb, &mut cx))?;
        match outcome {
            CheckOutcome::Unchanged => {}
            CheckOutcome::NewMail => {
                if !mb.quiet {
                    info!(path = %mb.path.display(), "{}", i18n::msg_new_mail());
                }
            }
            CheckOutcome::Reopened => {
                if !mb.quiet {
                    warn!(path = %mb.path.display(), "{}", i18n::msg_reopened());
                }
            }
        }
        if outcome != CheckOutcome::Unchanged && !mb.no_sort {
            mb.sort();
        }
        Ok(outcome)
    }

    // ── Copy ───────────────────────────────────────────────────

    /// Copy message `msgno` of `src` into the append session `dest`,
    /// keeping its flags and received time.
    pub fn append_message(&mut self, dest: &mut Mailbox, src: &mut Mailbox, msgno: usize) -> Result<()> {
        let template = src
            .record(msgno)
            .cloned()
            .ok_or_else(|| MxError::BadHandle(format!("no message number {}", msgno + 1)))?;
        let mut input = src.open_message(msgno)?;

        let opts = NewMessageOptions {
            add_from: !src.kind.is_flat_file(),
            draft: false,
            sender_fallback: self.config.mailbox.username.clone(),
        };
        let mut output = match dest.open_new_message(Some(&template), opts) {
            Ok(msg) => msg,
            Err(e) => {
                let _ = src.close_message(input);
                return Err(e);
            }
        };
        if dest.kind.is_flat_file() {
            if let Some(line) = input.from_line.take() {
                output.from_line = Some(line);
            }
        }

        let copied = io::copy(&mut input, &mut output).map_err(|e| MxError::io(&dest.path, e));
        let committed = copied.and_then(|_| dest.commit_message(&mut output));
        let closed = dest.close_message(output);
        let _ = src.close_message(input);
        committed?;
        closed
    }

    // ── Probes ─────────────────────────────────────────────────

    /// Whether the mailbox at `path` holds no message, without opening a
    /// session.
    pub fn is_empty(&self, path: &Path) -> Result<bool> {
        let kind = match self.classify(path)? {
            MailboxKind::Unknown => return Err(MxError::NotAMailbox(path.to_path_buf())),
            kind => kind,
        };
        let ops = self.registry.create(kind).ok_or(MxError::Unsupported {
            kind,
            op: Operation::CheckEmpty,
        })?;
        if !ops.supports(Operation::CheckEmpty) {
            return Err(MxError::Unsupported {
                kind,
                op: Operation::CheckEmpty,
            });
        }
        ops.check_empty(path)
    }

    /// Whether the mailbox at `path` may be read, or written with `write`.
    pub fn access(&self, path: &Path, write: bool) -> Result<bool> {
        if let Some(kind) = path.to_str().and_then(crate::detect::remote_kind) {
            let ops = self.registry.create(kind).ok_or(MxError::Unsupported {
                kind,
                op: Operation::Access,
            })?;
            let raw = path.to_string_lossy();
            return ops.access(&raw, write);
        }
        let mode = if write {
            nix::unistd::AccessFlags::W_OK
        } else {
            nix::unistd::AccessFlags::R_OK
        };
        match nix::unistd::access(path, mode) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::EACCES | nix::errno::Errno::EROFS) => Ok(false),
            Err(errno) => Err(MxError::io(path, io::Error::from(errno))),
        }
    }
}

/// Forget every deletion: the user chose not to purge.
fn clear_deleted(mb: &mut Mailbox) {
    for rec in &mut mb.records {
        rec.flags.deleted = false;
        rec.flags.purge = false;
    }
    mb.counters.deleted = 0;
}

/// Remove a flat-file mailbox that is empty, checking its size again
/// under an exclusive lock first.
fn unlink_empty(path: &Path, config: &Config) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| MxError::io(path, e))?;
    let lock = LockHandle::acquire(
        path,
        &file,
        LockRequest::exclusive(),
        &config.lock_settings(),
        &mut NonInteractive,
    )?;
    let empty = file.metadata().map(|m| m.len() == 0).unwrap_or(false);
    if empty {
        fs::remove_file(path).map_err(|e| MxError::io(path, e))?;
        debug!(path = %path.display(), "Removed empty mailbox");
    }
    lock.release();
    Ok(())
}
