//! Mailbox kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Storage or protocol family of a mailbox. Fixed for the life of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailboxKind {
    Mbox,
    Mmdf,
    Mh,
    Maildir,
    Imap,
    Pop,
    Nntp,
    Notmuch,
    Compressed,
    /// Classified, but not a mailbox.
    Unknown,
}

impl MailboxKind {
    /// Parse a configured default kind. Only local kinds are accepted.
    pub fn from_default_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mbox" => Some(Self::Mbox),
            "mmdf" => Some(Self::Mmdf),
            "mh" => Some(Self::Mh),
            "maildir" => Some(Self::Maildir),
            _ => None,
        }
    }

    /// Single-file kinds whose messages are separated inside one byte stream.
    pub fn is_flat_file(self) -> bool {
        matches!(self, Self::Mbox | Self::Mmdf)
    }

    /// Directory kinds storing one physical file per message.
    pub fn is_per_message_file(self) -> bool {
        matches!(self, Self::Mh | Self::Maildir)
    }

    /// Kinds reached over a protocol rather than the local filesystem.
    pub fn is_remote(self) -> bool {
        matches!(self, Self::Imap | Self::Pop | Self::Nntp | Self::Notmuch)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Mbox => "mbox",
            Self::Mmdf => "MMDF",
            Self::Mh => "MH",
            Self::Maildir => "maildir",
            Self::Imap => "IMAP",
            Self::Pop => "POP",
            Self::Nntp => "NNTP",
            Self::Notmuch => "notmuch",
            Self::Compressed => "compressed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MailboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
