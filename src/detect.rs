//! Mailbox format detection.
//!
//! Classification looks, in order, at a URL scheme, at the directory
//! shape, at the file size, and finally at the first non-blank line of
//! the file. Reading that line must not disturb new-mail tracking, so the
//! file times are put back afterwards.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use tracing::debug;

use crate::config::Config;
use crate::error::{MxError, Result};
use crate::model::kind::MailboxKind;
use crate::stamp::FileStamp;

/// The MMDF message separator line.
pub const MMDF_SEP: &[u8] = b"\x01\x01\x01\x01\n";

/// Longest first line looked at when sniffing content.
const SNIFF_LIMIT: u64 = 1024;

/// Files whose presence marks a directory as an MH folder.
const MH_MARKERS: &[&str] = &[
    ".mh_sequences",
    ".xmhcache",
    ".mew_cache",
    ".mew-cache",
    ".sylpheed_cache",
    ".overview",
];

/// A collaborator able to read and write compressed mailboxes.
pub trait Compression {
    /// Whether an existing `path` can be opened through this collaborator.
    fn can_read(&self, path: &Path) -> bool;
    /// Whether a new mailbox at `path` would be written through it.
    fn can_append(&self, path: &Path) -> bool;
}

/// Claims paths by file-name suffix (e.g. `.gz`, `.bz2`).
#[derive(Debug, Clone, Default)]
pub struct SuffixCompression {
    suffixes: Vec<String>,
}

impl SuffixCompression {
    pub fn new(suffixes: impl IntoIterator<Item = String>) -> Self {
        Self {
            suffixes: suffixes.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    fn matches(&self, path: &Path) -> bool {
        let name = path.to_string_lossy();
        self.suffixes.iter().any(|s| name.ends_with(s.as_str()))
    }
}

impl Compression for SuffixCompression {
    fn can_read(&self, path: &Path) -> bool {
        self.matches(path) && path.is_file()
    }

    fn can_append(&self, path: &Path) -> bool {
        self.matches(path)
    }
}

/// Remote kind named by a scheme prefix (or the `{host}` shorthand).
///
/// Never touches the filesystem.
pub fn remote_kind(path: &str) -> Option<MailboxKind> {
    if path.starts_with('{') {
        return Some(MailboxKind::Imap);
    }
    let (scheme, _) = path.split_once(':')?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    match scheme.to_ascii_lowercase().as_str() {
        "imap" | "imaps" => Some(MailboxKind::Imap),
        "pop" | "pops" => Some(MailboxKind::Pop),
        "nntp" | "nntps" | "news" | "snews" => Some(MailboxKind::Nntp),
        "notmuch" => Some(MailboxKind::Notmuch),
        _ => None,
    }
}

/// Whether `dir` has the shape of a maildir.
pub fn is_maildir(dir: &Path) -> bool {
    dir.join("cur").is_dir() && dir.join("new").is_dir()
}

/// Whether `dir` carries one of the MH folder marker files.
pub fn is_mh(dir: &Path) -> bool {
    MH_MARKERS.iter().any(|marker| dir.join(marker).exists())
}

/// Classifies paths into mailbox kinds.
pub struct Detector<'a> {
    default_kind: MailboxKind,
    check_mbox_size: bool,
    compression: Option<&'a dyn Compression>,
}

impl<'a> Detector<'a> {
    pub fn new(default_kind: MailboxKind) -> Self {
        Self {
            default_kind,
            check_mbox_size: false,
            compression: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            default_kind: config.default_kind(),
            check_mbox_size: config.mailbox.check_mbox_size,
            compression: None,
        }
    }

    /// New mail is tracked by size, so times need not be restored.
    pub fn check_mbox_size(mut self, on: bool) -> Self {
        self.check_mbox_size = on;
        self
    }

    pub fn with_compression(mut self, compression: Option<&'a dyn Compression>) -> Self {
        self.compression = compression;
        self
    }

    /// Classify `path`.
    ///
    /// `Ok(MailboxKind::Unknown)` means the path exists but is not a
    /// mailbox; `Err` means it could not be examined at all.
    pub fn classify(&self, path: &Path) -> Result<MailboxKind> {
        if let Some(kind) = path.to_str().and_then(remote_kind) {
            return Ok(kind);
        }

        let meta = std::fs::metadata(path).map_err(|e| {
            debug!(path = %path.display(), error = %e, "Unable to stat");
            MxError::Detection {
                path: path.to_path_buf(),
                source: e,
            }
        })?;

        let mut kind = MailboxKind::Unknown;
        if meta.is_dir() {
            if is_maildir(path) {
                return Ok(MailboxKind::Maildir);
            }
            if is_mh(path) {
                return Ok(MailboxKind::Mh);
            }
        } else if meta.len() == 0 {
            // Nothing to look at; trust the configured default.
            return Ok(if self.default_kind.is_flat_file() {
                self.default_kind
            } else {
                MailboxKind::Mbox
            });
        } else {
            let stamp = FileStamp::from_metadata(&meta);
            let file = File::open(path).map_err(|e| {
                debug!(path = %path.display(), error = %e, "Unable to open for reading");
                MxError::Detection {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;
            kind = sniff(file).map_err(|e| MxError::Detection {
                path: path.to_path_buf(),
                source: e,
            })?;

            if !self.check_mbox_size {
                if let Err(e) = stamp.restore(path) {
                    debug!(path = %path.display(), error = %e, "Could not restore file times");
                }
            }
        }

        if kind == MailboxKind::Unknown {
            if let Some(compression) = self.compression {
                if compression.can_read(path) {
                    return Ok(MailboxKind::Compressed);
                }
            }
        }
        debug!(path = %path.display(), %kind, "Classified");
        Ok(kind)
    }
}

/// Look at the first non-blank line of a flat file.
fn sniff(file: File) -> std::io::Result<MailboxKind> {
    let mut reader = BufReader::new(file);

    // Some tools put a blank line in front of the first message.
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(MailboxKind::Unknown);
        }
        let skip = buf.iter().take_while(|&&b| b == b'\n' || b == b'\r').count();
        let len = buf.len();
        reader.consume(skip);
        if skip < len {
            break;
        }
    }

    let mut line = Vec::new();
    reader.take(SNIFF_LIMIT).read_until(b'\n', &mut line)?;
    Ok(if line.starts_with(b"From ") {
        MailboxKind::Mbox
    } else if line == MMDF_SEP {
        MailboxKind::Mmdf
    } else {
        MailboxKind::Unknown
    })
}

/// Classify with the configured defaults and no compression collaborator.
pub fn classify(path: &Path, config: &Config) -> Result<MailboxKind> {
    Detector::from_config(config).classify(path)
}
