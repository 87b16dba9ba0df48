//! The open mailbox session.
//!
//! A [`Mailbox`] owns its records, the visible view over them, the
//! aggregate counters and the look-aside indices. Backends fill it during
//! a scan through [`Mailbox::push_record`] and [`Mailbox::update_context`];
//! the lifecycle pipelines in [`crate::mx`] drive it from open to close.

pub mod index;
pub mod reconcile;
pub mod sort;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::backend::{Backend, HandleFlags, Message, NewMessage, Operation};
use crate::error::{MxError, Result};
use crate::model::kind::MailboxKind;
use crate::model::record::{MessageRecord, RecordId};
use crate::parser::header::format_from_line;
use crate::stamp::FileStamp;

use index::{HashIndex, LabelIndex};
use sort::SortKey;

/// Records the index table grows by at once.
const GROWTH: usize = 25;

/// Sender used in generated `From ` lines when nothing better is known.
const DEFAULT_SENDER: &str = "MAILER-DAEMON";

/// How a session is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub readonly: bool,
    /// Only looking: put access times back on close and leave new-mail
    /// notification alone.
    pub peek: bool,
    /// Suppress informational notices.
    pub quiet: bool,
    /// Keep storage order after open.
    pub no_sort: bool,
}

impl OpenFlags {
    pub fn readonly() -> Self {
        Self {
            readonly: true,
            ..Self::default()
        }
    }

    pub fn peek() -> Self {
        Self {
            readonly: true,
            peek: true,
            quiet: true,
            ..Self::default()
        }
    }
}

/// Aggregate counters, kept exact by reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub deleted: usize,
    pub flagged: usize,
    pub unread: usize,
    pub new: usize,
    pub tagged: usize,
    /// Some record differs from storage.
    pub changed: bool,
    /// Bytes of the visible messages.
    pub vsize: u64,
    /// Bytes of the mailbox as last seen on disk.
    pub size: u64,
}

/// Flags settable through [`Mailbox::set_flag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Delete,
    Purge,
    Read,
    Old,
    Flagged,
    Replied,
    Tag,
}

/// Options for [`Mailbox::open_new_message`].
#[derive(Debug, Clone, Default)]
pub struct NewMessageOptions {
    /// Generate a `From ` envelope line for flat-file targets.
    pub add_from: bool,
    pub draft: bool,
    /// Envelope sender when the template names none.
    pub sender_fallback: Option<String>,
}

/// An open mailbox.
pub struct Mailbox {
    pub(crate) path: PathBuf,
    pub(crate) realpath: PathBuf,
    pub(crate) kind: MailboxKind,
    pub(crate) ops: Option<Box<dyn Backend>>,

    pub(crate) readonly: bool,
    pub(crate) peek: bool,
    pub(crate) append: bool,
    pub(crate) quiet: bool,
    pub(crate) closing: bool,
    pub(crate) dont_write: bool,
    pub(crate) no_sort: bool,
    /// Maildir deletions only set the trashed flag.
    pub(crate) maildir_trash: bool,
    pub(crate) interrupted: bool,
    closed: bool,

    /// Times before the session touched the mailbox.
    pub(crate) stamp: Option<FileStamp>,

    pub(crate) records: Vec<MessageRecord>,
    pub(crate) v2r: Vec<usize>,
    hdrmax: usize,
    pub(crate) counters: Counters,

    pub(crate) id_hash: Option<HashIndex>,
    pub(crate) subj_hash: Option<HashIndex>,
    pub(crate) labels: LabelIndex,
    /// Record identity to storage index.
    pub(crate) slots: HashMap<RecordId, usize>,
    pub(crate) last_tag: Option<RecordId>,

    pub(crate) limit: Option<Box<dyn Fn(&MessageRecord) -> bool>>,
    pub(crate) sort_key: SortKey,
    next_id: u64,
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("readonly", &self.readonly)
            .field("append", &self.append)
            .field("msg_count", &self.records.len())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl Mailbox {
    /// A session over `path` without a backend attached yet.
    pub fn new(path: &Path, kind: MailboxKind, flags: OpenFlags) -> Self {
        let realpath = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self {
            path: path.to_path_buf(),
            realpath,
            kind,
            ops: None,
            readonly: flags.readonly,
            peek: flags.peek,
            append: false,
            quiet: flags.quiet,
            closing: false,
            dont_write: false,
            no_sort: flags.no_sort,
            maildir_trash: false,
            interrupted: false,
            closed: false,
            stamp: None,
            records: Vec::new(),
            v2r: Vec::new(),
            hdrmax: 0,
            counters: Counters::default(),
            id_hash: None,
            subj_hash: None,
            labels: LabelIndex::default(),
            slots: HashMap::new(),
            last_tag: None,
            limit: None,
            sort_key: SortKey::default(),
            next_id: 1,
        }
    }

    pub(crate) fn attach(&mut self, ops: Box<dyn Backend>) {
        self.ops = Some(ops);
    }

    /// Run a backend operation with the backend taken out of the session.
    pub(crate) fn dispatch<T>(
        &mut self,
        op: Operation,
        f: impl FnOnce(&mut dyn Backend, &mut Mailbox) -> Result<T>,
    ) -> Result<T> {
        let mut ops = self.ops.take().ok_or(MxError::NotOpen)?;
        let result = if ops.supports(op) {
            f(ops.as_mut(), self)
        } else {
            Err(MxError::Unsupported {
                kind: self.kind,
                op,
            })
        };
        self.ops = Some(ops);
        result
    }

    pub(crate) fn supports(&self, op: Operation) -> bool {
        self.ops.as_ref().is_some_and(|ops| ops.supports(op))
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Canonical path, used for identity comparisons.
    pub fn realpath(&self) -> &Path {
        &self.realpath
    }

    pub fn kind(&self) -> MailboxKind {
        self.kind
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_peek(&self) -> bool {
        self.peek
    }

    pub fn is_append(&self) -> bool {
        self.append
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a scan stopped before the end of the mailbox.
    pub fn was_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Disable (or re-enable) writes without reopening read-only.
    pub fn set_dont_write(&mut self, on: bool) {
        self.dont_write = on;
    }

    pub fn is_writable(&self) -> bool {
        !self.readonly && !self.dont_write
    }

    pub fn msg_count(&self) -> usize {
        self.records.len()
    }

    /// Number of messages in the current view.
    pub fn vcount(&self) -> usize {
        self.v2r.len()
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn size(&self) -> u64 {
        self.counters.size
    }

    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    pub fn record(&self, msgno: usize) -> Option<&MessageRecord> {
        self.records.get(msgno)
    }

    /// Visible index to storage index.
    pub fn v2r(&self) -> &[usize] {
        &self.v2r
    }

    /// Records in view order.
    pub fn visible(&self) -> impl Iterator<Item = &MessageRecord> {
        self.v2r.iter().filter_map(|&msgno| self.records.get(msgno))
    }

    /// Storage index of the record with identity `id`, if it still exists.
    pub fn resolve(&self, id: RecordId) -> Option<usize> {
        self.slots.get(&id).copied()
    }

    pub fn last_tagged(&self) -> Option<usize> {
        self.last_tag.and_then(|id| self.resolve(id))
    }

    pub fn labels(&self) -> &LabelIndex {
        &self.labels
    }

    pub fn id_hash(&self) -> Option<&HashIndex> {
        self.id_hash.as_ref()
    }

    pub fn subj_hash(&self) -> Option<&HashIndex> {
        self.subj_hash.as_ref()
    }

    pub fn sort_key(&self) -> SortKey {
        self.sort_key
    }

    pub fn set_sort_key(&mut self, key: SortKey) {
        self.sort_key = key;
    }

    /// Look up a message by its `Message-ID`, building the index on demand.
    pub fn find_message_id(&mut self, message_id: &str) -> Option<usize> {
        if self.id_hash.is_none() {
            self.id_hash = Some(self.make_id_hash(self.records.len()));
        }
        let id = self.id_hash.as_ref()?.find(message_id)?;
        self.resolve(id)
    }

    fn make_id_hash(&self, upto: usize) -> HashIndex {
        let mut index = HashIndex::new();
        for rec in &self.records[..upto.min(self.records.len())] {
            if let Some(mid) = rec.envelope.message_id.as_deref() {
                index.insert(mid, rec.id);
            }
        }
        index
    }

    pub(crate) fn make_subj_hash(&self) -> HashIndex {
        let mut index = HashIndex::new();
        for rec in &self.records {
            if let Some(subject) = rec.envelope.real_subject.as_deref() {
                index.insert(subject, rec.id);
            }
        }
        index
    }

    // ── Table growth and scan hand-off ─────────────────────────

    /// Grow the index tables by a fixed step.
    ///
    /// The byte size of the grown table is checked before reserving, and
    /// wrapping arithmetic is reported as [`MxError::IntegerOverflow`].
    pub fn alloc_memory(&mut self) -> Result<()> {
        let new_max = self
            .hdrmax
            .checked_add(GROWTH)
            .ok_or(MxError::IntegerOverflow)?;
        let bytes = new_max
            .checked_mul(std::mem::size_of::<MessageRecord>())
            .ok_or(MxError::IntegerOverflow)?;
        if bytes > isize::MAX as usize {
            return Err(MxError::IntegerOverflow);
        }
        self.records
            .reserve_exact(new_max.saturating_sub(self.records.len()));
        self.v2r.reserve_exact(new_max.saturating_sub(self.v2r.len()));
        self.hdrmax = new_max;
        Ok(())
    }

    /// Capacity of the index tables.
    pub fn capacity(&self) -> usize {
        self.hdrmax
    }

    /// Append a scanned record to storage, returning its storage index.
    ///
    /// The record is not counted or indexed until [`Self::update_context`].
    pub fn push_record(&mut self, mut rec: MessageRecord) -> Result<usize> {
        if self.records.len() >= self.hdrmax {
            self.alloc_memory()?;
        }
        let msgno = self.records.len();
        rec.id = RecordId(self.next_id);
        self.next_id += 1;
        rec.msgno = msgno;
        rec.virtual_index = None;
        self.slots.insert(rec.id, msgno);
        self.records.push(rec);
        Ok(msgno)
    }

    /// Fold the last `new_messages` pushed records into view, indices and
    /// counters.
    pub fn update_context(&mut self, new_messages: usize) {
        let total = self.records.len();
        let first = total.saturating_sub(new_messages);

        for msgno in first..total {
            if self.limit.is_none() {
                self.records[msgno].virtual_index = Some(self.v2r.len());
                self.v2r.push(msgno);
                self.counters.vsize += self.records[msgno].content.size();
            } else {
                self.records[msgno].virtual_index = None;
            }
            self.records[msgno].msgno = msgno;
            self.slots.insert(self.records[msgno].id, msgno);

            if let Some(sup) = self.records[msgno].envelope.supersedes.clone() {
                if self.id_hash.is_none() {
                    self.id_hash = Some(self.make_id_hash(msgno));
                }
                let older = self
                    .id_hash
                    .as_ref()
                    .and_then(|index| index.find(&sup))
                    .and_then(|id| self.resolve(id));
                if let Some(older) = older {
                    self.records[older].flags.superseded = true;
                }
            }

            let rec = &self.records[msgno];
            if let (Some(index), Some(mid)) = (self.id_hash.as_mut(), rec.envelope.message_id.as_deref()) {
                index.insert(mid, rec.id);
            }
            if let (Some(index), Some(subject)) =
                (self.subj_hash.as_mut(), rec.envelope.real_subject.as_deref())
            {
                index.insert(subject, rec.id);
            }
            self.labels.add(&rec.envelope.labels);

            let flags = rec.flags;
            if flags.changed {
                self.counters.changed = true;
            }
            if flags.flagged {
                self.counters.flagged += 1;
            }
            if flags.deleted {
                self.counters.deleted += 1;
            }
            if flags.tagged {
                self.counters.tagged += 1;
            }
            if !flags.read {
                self.counters.unread += 1;
                if !flags.old {
                    self.counters.new += 1;
                }
            }
        }
    }

    // ── Flags and view ─────────────────────────────────────────

    /// Set or clear one flag, keeping the counters in step.
    ///
    /// Only tagging works on a read-only session.
    pub fn set_flag(&mut self, msgno: usize, flag: Flag, on: bool) -> Result<()> {
        if msgno >= self.records.len() {
            return Err(MxError::BadHandle(format!("no message number {}", msgno + 1)));
        }
        if self.readonly && flag != Flag::Tag {
            debug!(msgno, ?flag, "Ignoring flag change on read-only mailbox");
            return Ok(());
        }

        let maildir_trash = self.kind == MailboxKind::Maildir && self.maildir_trash;
        let c = &mut self.counters;
        let rec = &mut self.records[msgno];
        let f = &mut rec.flags;
        let mut changed = false;

        match flag {
            Flag::Delete => {
                if on && !f.deleted {
                    f.deleted = true;
                    c.deleted += 1;
                    changed = maildir_trash;
                } else if !on && f.deleted {
                    f.deleted = false;
                    c.deleted = c.deleted.saturating_sub(1);
                    changed = maildir_trash;
                }
            }
            Flag::Purge => f.purge = on,
            Flag::Read => {
                if on && !f.read {
                    f.read = true;
                    c.unread = c.unread.saturating_sub(1);
                    if !f.old {
                        c.new = c.new.saturating_sub(1);
                    }
                    changed = true;
                } else if !on && f.read {
                    f.read = false;
                    c.unread += 1;
                    if !f.old {
                        c.new += 1;
                    }
                    changed = true;
                }
            }
            Flag::Old => {
                if on != f.old {
                    f.old = on;
                    if !f.read {
                        if on {
                            c.new = c.new.saturating_sub(1);
                        } else {
                            c.new += 1;
                        }
                    }
                    changed = true;
                }
            }
            Flag::Flagged => {
                if on != f.flagged {
                    f.flagged = on;
                    if on {
                        c.flagged += 1;
                    } else {
                        c.flagged = c.flagged.saturating_sub(1);
                    }
                    changed = true;
                }
            }
            Flag::Replied => {
                if on && !f.replied {
                    f.replied = true;
                    if !f.read {
                        f.read = true;
                        c.unread = c.unread.saturating_sub(1);
                        if !f.old {
                            c.new = c.new.saturating_sub(1);
                        }
                    }
                    changed = true;
                } else if !on && f.replied {
                    f.replied = false;
                    changed = true;
                }
            }
            Flag::Tag => {
                if on != f.tagged {
                    f.tagged = on;
                    if on {
                        c.tagged += 1;
                    } else {
                        c.tagged = c.tagged.saturating_sub(1);
                    }
                }
                if on {
                    self.last_tag = Some(rec.id);
                }
            }
        }

        if changed {
            rec.flags.changed = true;
            self.counters.changed = true;
        }
        Ok(())
    }

    /// Restrict the view to records matching `predicate`.
    pub fn set_limit(&mut self, predicate: impl Fn(&MessageRecord) -> bool + 'static) {
        for rec in &mut self.records {
            rec.virtual_index = predicate(rec).then_some(0);
        }
        self.limit = Some(Box::new(predicate));
        self.rebuild_view();
    }

    /// Show every record again.
    pub fn clear_limit(&mut self) {
        self.limit = None;
        for rec in &mut self.records {
            rec.virtual_index = Some(0);
        }
        self.rebuild_view();
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    // ── Message streams ────────────────────────────────────────

    /// Open message `msgno` for reading.
    pub fn open_message(&mut self, msgno: usize) -> Result<Message> {
        if msgno >= self.records.len() {
            return Err(MxError::BadHandle(format!("no message number {}", msgno + 1)));
        }
        self.dispatch(Operation::OpenMessage, |ops, mb| ops.open_message(mb, msgno))
    }

    /// Start a new message in this (append-mode) mailbox.
    ///
    /// Flags and received time come from `template` when copying.
    pub fn open_new_message(
        &mut self,
        template: Option<&MessageRecord>,
        opts: NewMessageOptions,
    ) -> Result<Message> {
        let mut flags = HandleFlags {
            draft: opts.draft,
            ..HandleFlags::default()
        };
        let mut received = Utc::now();
        let mut sender = None;
        if let Some(t) = template {
            flags.read = t.flags.read;
            flags.flagged = t.flags.flagged;
            flags.replied = t.flags.replied;
            received = t.received;
            sender = t.envelope.sender.clone();
        }

        let from_line = (self.kind.is_flat_file() && opts.add_from).then(|| {
            let sender = sender
                .or(opts.sender_fallback)
                .unwrap_or_else(|| DEFAULT_SENDER.to_string());
            format_from_line(&sender, received)
        });

        let new = NewMessage {
            flags,
            received,
            from_line,
        };
        self.dispatch(Operation::OpenNewMessage, |ops, mb| {
            ops.open_new_message(mb, new)
        })
    }

    /// Make a written message part of the mailbox.
    pub fn commit_message(&mut self, msg: &mut Message) -> Result<()> {
        if !msg.is_writable() {
            return Err(MxError::BadHandle("message is not open for writing".into()));
        }
        if !self.append {
            return Err(MxError::BadHandle("mailbox is not opened for appending".into()));
        }
        self.dispatch(Operation::CommitMessage, |ops, mb| ops.commit_message(mb, msg))
    }

    /// Close a message stream. An uncommitted delivery is discarded.
    pub fn close_message(&mut self, mut msg: Message) -> Result<()> {
        let result = if self.supports(Operation::CloseMessage) {
            self.dispatch(Operation::CloseMessage, |ops, mb| ops.close_message(mb, &mut msg))
        } else {
            Ok(())
        };
        msg.abort();
        result
    }

    // ── Teardown ───────────────────────────────────────────────

    /// Release everything the session holds. Safe to call more than once.
    ///
    /// A peek session that left the mailbox unmodified puts its access and
    /// modification times back.
    pub fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // A peek must not clear the new-mail indicator (mtime newer than
        // atime). Times go back only if nobody wrote the file meanwhile, so
        // a delivery during the peek keeps its own mtime.
        if self.peek {
            if let Some(stamp) = self.stamp {
                let unchanged = FileStamp::capture(&self.path)
                    .map(|now| now.mtime == stamp.mtime)
                    .unwrap_or(false);
                if unchanged {
                    if let Err(e) = stamp.restore(&self.path) {
                        warn!(path = %self.path.display(), error = %e, "Could not restore mailbox times");
                    }
                }
            }
        }

        if let Some(mut ops) = self.ops.take() {
            ops.close(self);
        }

        self.subj_hash = None;
        self.id_hash = None;
        self.labels.clear();
        self.slots.clear();
        self.last_tag = None;
        self.records = Vec::new();
        self.v2r = Vec::new();
        self.hdrmax = 0;
        self.limit = None;
        self.counters = Counters::default();
        debug!(path = %self.path.display(), "Session closed");
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.teardown();
    }
}
