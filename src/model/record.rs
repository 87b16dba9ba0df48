//! Per-message records owned by a mailbox session.

use chrono::{DateTime, Utc};

/// Stable identity of a record for the life of its session.
///
/// Identities are never reused, so a stale id held by a look-aside index
/// resolves to nothing once the record has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub(crate) u64);

/// Boolean state of one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags {
    pub deleted: bool,
    pub read: bool,
    pub old: bool,
    pub flagged: bool,
    pub replied: bool,
    pub tagged: bool,
    /// Deleted with permanent removal intended (skips the trash).
    pub purge: bool,
    /// Flags differ from what is stored on disk.
    pub changed: bool,
    /// Still present in the backing store; cleared by a backend that
    /// notices the message vanished.
    pub active: bool,
    /// Hidden internally without counting as a user deletion.
    pub quasi_deleted: bool,
    /// A later message carries a `Supersedes:` naming this one.
    pub superseded: bool,
}

/// Where a message lives inside its container.
///
/// For flat files `start` is the separator line, `hdr_offset` the first
/// header byte and `offset` the first body byte. Per-file kinds use the
/// same fields relative to the message file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentLocation {
    pub start: u64,
    pub hdr_offset: u64,
    pub offset: u64,
    pub length: u64,
}

impl ContentLocation {
    /// Bytes this message contributes to the mailbox: headers plus body.
    pub fn size(&self) -> u64 {
        (self.length + self.offset).saturating_sub(self.hdr_offset)
    }
}

/// Envelope fields the session needs for index maintenance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeRef {
    pub message_id: Option<String>,
    /// Subject with reply prefixes removed, used for threading.
    pub real_subject: Option<String>,
    pub supersedes: Option<String>,
    /// Envelope sender used when a `From ` line has to be generated.
    pub sender: Option<String>,
    pub labels: Vec<String>,
}

/// One logical message.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub(crate) id: RecordId,
    /// Storage index.
    pub msgno: usize,
    /// Position in the visible view, `None` when filtered out.
    pub virtual_index: Option<usize>,
    pub flags: MessageFlags,
    pub content: ContentLocation,
    pub received: DateTime<Utc>,
    pub date_sent: DateTime<Utc>,
    pub envelope: EnvelopeRef,
    /// Backend-private locator (file name relative to the mailbox for
    /// per-message-file kinds).
    pub path: Option<String>,
}

impl MessageRecord {
    /// A freshly scanned record. The session assigns identity and position
    /// when the record is pushed.
    pub fn new(content: ContentLocation, received: DateTime<Utc>, envelope: EnvelopeRef) -> Self {
        Self {
            id: RecordId(0),
            msgno: 0,
            virtual_index: None,
            flags: MessageFlags {
                active: true,
                ..MessageFlags::default()
            },
            content,
            received,
            date_sent: received,
            envelope,
            path: None,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Unread and not yet seen by any session.
    pub fn is_new(&self) -> bool {
        !self.flags.read && !self.flags.old
    }

    /// Candidate for relocation to the read-mail folder on close.
    pub fn is_relocatable(&self, keep_flagged: bool) -> bool {
        self.flags.read && !self.flags.deleted && !(self.flags.flagged && keep_flagged)
    }
}
