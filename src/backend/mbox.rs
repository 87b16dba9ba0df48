//! Flat-file backend for mbox and MMDF mailboxes.
//!
//! Scans run under a shared kernel lock. Appends and rewrites take an
//! exclusive lock plus the cooperative dot-lock when configured.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt as UnixFileExt;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use tracing::{debug, info, warn};

use super::{Backend, CheckOutcome, Cx, Message, NewMessage, OpenOutcome, Operation};
use crate::detect::MMDF_SEP;
use crate::error::{MxError, Result};
use crate::lock::LockHandle;
use crate::model::kind::MailboxKind;
use crate::model::record::{ContentLocation, MessageFlags, MessageRecord};
use crate::parser::header::{self, StatusFlags};
use crate::parser::mbox::{self as scanner, Flavor, ScannedMessage};
use crate::session::Mailbox;
use crate::stamp::FileStamp;

const DEFAULT_SENDER: &str = "MAILER-DAEMON";

/// An append session's open file and the lock guarding it.
struct AppendTarget {
    file: File,
    /// Separator padding still owed before the first committed message.
    pad: &'static [u8],
    _lock: LockHandle,
}

/// How the file differs from what the index was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Unchanged,
    /// New messages follow the old end of file.
    Appended,
    /// Rewritten in place; known offsets cannot be trusted.
    Modified,
}

/// Backend for single-file mailboxes.
pub struct FlatBackend {
    kind: MailboxKind,
    /// Size and mtime the index was built against.
    known: Option<FileStamp>,
    append: Option<AppendTarget>,
}

impl FlatBackend {
    pub fn new(kind: MailboxKind) -> Self {
        debug_assert!(kind.is_flat_file());
        Self {
            kind,
            known: None,
            append: None,
        }
    }

    fn flavor(&self) -> Flavor {
        match self.kind {
            MailboxKind::Mmdf => Flavor::Mmdf,
            _ => Flavor::Mbox,
        }
    }

    /// Scan `file` from `base` and push every message found.
    ///
    /// Returns the number of records pushed and whether the scan reached
    /// the end of the file.
    fn scan_from(
        &self,
        mb: &mut Mailbox,
        file: &File,
        base: u64,
        cx: &Cx<'_>,
    ) -> Result<(usize, bool)> {
        let path = mb.path().to_path_buf();
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(base))
            .map_err(|e| MxError::io(&path, e))?;

        let mut pushed = 0usize;
        let mut failure = None;
        let (_, complete) = scanner::scan(&mut reader, self.flavor(), base, &mut |scanned| {
            match mb.push_record(record_from(scanned)) {
                Ok(_) => {
                    pushed += 1;
                    !cx.interrupted()
                }
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        })
        .map_err(|e| MxError::io(&path, e))?;

        if let Some(e) = failure {
            return Err(e);
        }
        Ok((pushed, complete))
    }

    /// Whether a message separator starts at `offset` (a single blank line
    /// in front of it is tolerated).
    fn separator_at(&self, file: &File, offset: u64) -> io::Result<bool> {
        let mut buf = [0u8; 6];
        let n = read_at_most(file, &mut buf, offset)?;
        let head = &buf[..n];
        let head = head.strip_prefix(b"\n").unwrap_or(head);
        Ok(match self.flavor() {
            Flavor::Mbox => head.starts_with(b"From "),
            Flavor::Mmdf => head.starts_with(MMDF_SEP),
        })
    }

    /// Compare the open `file` against the stamp the index was built from.
    fn change_since(&self, file: &File, known: &FileStamp) -> io::Result<Change> {
        let now = FileStamp::from_metadata(&file.metadata()?);
        if now.size == known.size && now.mtime == known.mtime {
            return Ok(Change::Unchanged);
        }
        if now.size > known.size && self.separator_at(file, known.size)? {
            return Ok(Change::Appended);
        }
        Ok(Change::Modified)
    }

    /// Rebuild the index after the file changed in place.
    ///
    /// Messages still present keep their pending deletion and tag. Those
    /// with unsaved flag changes keep every flag.
    fn reopen(&mut self, mb: &mut Mailbox, file: &File, cx: &Cx<'_>) -> Result<()> {
        let mut saved: HashMap<String, MessageFlags> = HashMap::new();
        for rec in mb.records() {
            saved.insert(match_key(rec), rec.flags);
        }

        for rec in &mut mb.records {
            rec.flags.active = false;
        }
        mb.update_tables(false);

        let (pushed, _) = self.scan_from(mb, file, 0, cx)?;
        let first = mb.msg_count() - pushed;
        for rec in &mut mb.records[first..] {
            let Some(old) = saved.get(&match_key(rec)) else {
                continue;
            };
            if old.changed {
                rec.flags = MessageFlags {
                    active: true,
                    quasi_deleted: false,
                    superseded: false,
                    ..*old
                };
            } else {
                rec.flags.deleted = old.deleted;
                rec.flags.purge = old.purge;
                rec.flags.tagged = old.tagged;
            }
        }
        mb.update_context(pushed);
        Ok(())
    }

    fn remember(&mut self, mb: &mut Mailbox, meta: &std::fs::Metadata) {
        let stamp = FileStamp::from_metadata(meta);
        mb.counters.size = stamp.size;
        self.known = Some(stamp);
    }
}

impl Backend for FlatBackend {
    fn kind(&self) -> MailboxKind {
        self.kind
    }

    fn supports(&self, op: Operation) -> bool {
        !matches!(op, Operation::Catchup | Operation::FastCopy | Operation::Access)
    }

    fn open(&mut self, mb: &mut Mailbox, cx: &mut Cx<'_>) -> Result<OpenOutcome> {
        let path = mb.path().to_path_buf();
        let file = File::open(&path).map_err(|e| MxError::io(&path, e))?;
        let lock = LockHandle::acquire(&path, &file, cx.read_lock(), &cx.lock_settings(), cx.prompt)?;
        let meta = file.metadata().map_err(|e| MxError::io(&path, e))?;

        let (pushed, complete) = self.scan_from(mb, &file, 0, cx)?;
        lock.release();

        self.remember(mb, &meta);
        mb.update_context(pushed);
        debug!(path = %path.display(), messages = pushed, complete, "Scanned flat mailbox");
        Ok(if complete {
            OpenOutcome::Complete
        } else {
            OpenOutcome::Interrupted
        })
    }

    fn open_append(&mut self, mb: &mut Mailbox, cx: &mut Cx<'_>, create: bool) -> Result<()> {
        let path = mb.path().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(create)
            .open(&path)
            .map_err(|e| MxError::io(&path, e))?;
        let lock = LockHandle::acquire(&path, &file, cx.write_lock(), &cx.lock_settings(), cx.prompt)?;

        // The next message must start on a line of its own, after a blank
        // line for mbox.
        let len = file.metadata().map_err(|e| MxError::io(&path, e))?.len();
        let mut pad: &'static [u8] = b"";
        if len > 0 {
            let mut tail = [0u8; 2];
            let n = len.min(2) as usize;
            file.read_exact_at(&mut tail[..n], len - n as u64)
                .map_err(|e| MxError::io(&path, e))?;
            let tail = &tail[..n];
            pad = if self.kind == MailboxKind::Mbox {
                if tail.ends_with(b"\n\n") {
                    b""
                } else if tail.ends_with(b"\n") {
                    b"\n"
                } else {
                    b"\n\n"
                }
            } else if tail.ends_with(b"\n") {
                b""
            } else {
                b"\n"
            };
        }

        self.append = Some(AppendTarget {
            file,
            pad,
            _lock: lock,
        });
        Ok(())
    }

    fn open_new_message(&mut self, _mb: &mut Mailbox, new: NewMessage) -> Result<Message> {
        let mut msg = Message::writing_memory(new.flags, new.received);
        msg.from_line = new.from_line;
        Ok(msg)
    }

    fn open_message(&mut self, mb: &mut Mailbox, msgno: usize) -> Result<Message> {
        let path = mb.path().to_path_buf();
        let rec = mb
            .record(msgno)
            .ok_or_else(|| MxError::BadHandle(format!("no message number {}", msgno + 1)))?;
        let file = File::open(&path).map_err(|e| MxError::io(&path, e))?;
        let end = rec.content.offset + rec.content.length;
        let mut bytes = vec![0u8; end.saturating_sub(rec.content.hdr_offset) as usize];
        file.read_exact_at(&mut bytes, rec.content.hdr_offset)
            .map_err(|e| MxError::io(&path, e))?;

        let mut envelope = vec![0u8; rec.content.hdr_offset.saturating_sub(rec.content.start) as usize];
        file.read_exact_at(&mut envelope, rec.content.start)
            .map_err(|e| MxError::io(&path, e))?;

        let mut msg = Message::reading_bytes(bytes, msgno, rec.received);
        msg.from_line = envelope
            .split_inclusive(|&b| b == b'\n')
            .find(|line| line.starts_with(b"From "))
            .map(|line| String::from_utf8_lossy(line).into_owned());
        msg.flags.read = rec.flags.read;
        msg.flags.flagged = rec.flags.flagged;
        msg.flags.replied = rec.flags.replied;
        Ok(msg)
    }

    fn commit_message(&mut self, mb: &mut Mailbox, msg: &mut Message) -> Result<()> {
        let path = mb.path().to_path_buf();
        let content = msg.contents().map_err(|e| MxError::io(&path, e))?;
        let target = self
            .append
            .as_mut()
            .ok_or_else(|| MxError::BadHandle("mailbox is not opened for appending".into()))?;

        let status = StatusFlags {
            read: msg.flags.read,
            old: msg.flags.read,
            replied: msg.flags.replied,
            flagged: msg.flags.flagged,
            deleted: false,
        };
        let mut out = Vec::with_capacity(content.len() + 128);
        out.extend_from_slice(target.pad);
        match self.kind {
            MailboxKind::Mmdf => {
                out.extend_from_slice(MMDF_SEP);
                if let Some(from) = msg.from_line.as_deref() {
                    out.extend_from_slice(from.as_bytes());
                }
                write_with_status(&mut out, &content, &status, false);
                if !out.ends_with(b"\n") {
                    out.push(b'\n');
                }
                out.extend_from_slice(MMDF_SEP);
            }
            _ => {
                let from = match msg.from_line.clone() {
                    Some(line) => line,
                    None => {
                        let sender = header::parse_header_block(header_block(&content))
                            .envelope
                            .sender
                            .unwrap_or_else(|| DEFAULT_SENDER.to_string());
                        header::format_from_line(&sender, msg.received)
                    }
                };
                out.extend_from_slice(from.as_bytes());
                write_with_status(&mut out, &content, &status, true);
                if !out.ends_with(b"\n") {
                    out.push(b'\n');
                }
                out.push(b'\n');
            }
        }

        target
            .file
            .write_all(&out)
            .and_then(|()| target.file.flush())
            .map_err(|e| MxError::io(&path, e))?;
        target.pad = b"";
        msg.mark_committed(None);
        Ok(())
    }

    fn check_new(&mut self, mb: &mut Mailbox, cx: &mut Cx<'_>) -> Result<CheckOutcome> {
        let path = mb.path().to_path_buf();
        let known = self.known.ok_or(MxError::NotOpen)?;
        let meta = std::fs::metadata(&path).map_err(|e| MxError::io(&path, e))?;
        let now = FileStamp::from_metadata(&meta);
        if now.size == known.size && now.mtime == known.mtime {
            return Ok(CheckOutcome::Unchanged);
        }

        let file = File::open(&path).map_err(|e| MxError::io(&path, e))?;
        let lock = LockHandle::acquire(&path, &file, cx.read_lock(), &cx.lock_settings(), cx.prompt)?;
        let meta = file.metadata().map_err(|e| MxError::io(&path, e))?;

        let outcome = match self.change_since(&file, &known).map_err(|e| MxError::io(&path, e))? {
            Change::Unchanged => CheckOutcome::Unchanged,
            Change::Appended => {
                let (pushed, _) = self.scan_from(mb, &file, known.size, cx)?;
                mb.update_context(pushed);
                info!(path = %path.display(), messages = pushed, "New mail appended");
                CheckOutcome::NewMail
            }
            Change::Modified => {
                info!(path = %path.display(), "Mailbox was modified, reopening");
                self.reopen(mb, &file, cx)?;
                CheckOutcome::Reopened
            }
        };
        lock.release();
        self.remember(mb, &meta);
        Ok(outcome)
    }

    fn sync(&mut self, mb: &mut Mailbox, cx: &mut Cx<'_>) -> Result<()> {
        let path = mb.path().to_path_buf();
        let known = self.known.ok_or(MxError::NotOpen)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| MxError::io(&path, e))?;
        let lock = LockHandle::acquire(&path, &file, cx.write_lock(), &cx.lock_settings(), cx.prompt)?;

        match self.change_since(&file, &known).map_err(|e| MxError::io(&path, e))? {
            Change::Unchanged => {}
            Change::Appended => {
                // Mail delivered since the last look is indexed first so the
                // rewrite keeps it.
                let (pushed, _) = self.scan_from(mb, &file, known.size, cx)?;
                mb.update_context(pushed);
                info!(path = %path.display(), messages = pushed, "New mail arrived during sync");
            }
            Change::Modified => {
                // Known offsets are stale. Nothing is written; the index is
                // rebuilt so the caller can look again and retry.
                warn!(path = %path.display(), "Mailbox was modified externally, not writing");
                let meta = file.metadata().map_err(|e| MxError::io(&path, e))?;
                self.reopen(mb, &file, cx)?;
                lock.release();
                self.remember(mb, &meta);
                return Err(MxError::Modified(path));
            }
        }

        let Some(first) = mb
            .records()
            .iter()
            .position(|r| r.flags.deleted || r.flags.changed)
        else {
            debug!(path = %path.display(), "Nothing to write");
            lock.release();
            return Ok(());
        };
        let rewrite_from = mb.records()[first].content.start;

        let mut tmp = tempfile::Builder::new()
            .prefix("mxshell-sync")
            .tempfile()
            .map_err(|e| MxError::io(&path, e))?;
        let mut layout: Vec<(usize, ContentLocation)> = Vec::new();
        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            let mut pos = rewrite_from;
            let mut buf = Vec::new();
            for rec in &mb.records()[first..] {
                if rec.flags.deleted {
                    continue;
                }
                let loc = rec.content;
                let start = pos;

                read_range(&file, loc.start, loc.hdr_offset, &mut buf).map_err(|e| MxError::io(&path, e))?;
                out.write_all(&buf).map_err(|e| MxError::io(&path, e))?;
                pos += buf.len() as u64;
                let hdr_offset = pos;

                read_range(&file, loc.hdr_offset, loc.offset, &mut buf).map_err(|e| MxError::io(&path, e))?;
                if rec.flags.changed {
                    let mut headers = Vec::with_capacity(buf.len() + 32);
                    write_headers_with_status(&mut headers, &buf, &status_of(&rec.flags));
                    buf = headers;
                }
                out.write_all(&buf).map_err(|e| MxError::io(&path, e))?;
                pos += buf.len() as u64;
                let offset = pos;

                read_range(&file, loc.offset, loc.offset + loc.length, &mut buf)
                    .map_err(|e| MxError::io(&path, e))?;
                out.write_all(&buf).map_err(|e| MxError::io(&path, e))?;
                pos += buf.len() as u64;

                let trailer: &[u8] = match self.kind {
                    MailboxKind::Mmdf => MMDF_SEP,
                    _ => b"\n",
                };
                out.write_all(trailer).map_err(|e| MxError::io(&path, e))?;
                pos += trailer.len() as u64;

                layout.push((
                    rec.msgno,
                    ContentLocation {
                        start,
                        hdr_offset,
                        offset,
                        length: loc.length,
                    },
                ));
            }
            out.flush().map_err(|e| MxError::io(&path, e))?;
        }

        let copy_back = |file: &mut File, tmp: &mut File| -> io::Result<u64> {
            tmp.seek(SeekFrom::Start(0))?;
            file.seek(SeekFrom::Start(rewrite_from))?;
            let written = io::copy(tmp, file)?;
            let new_len = rewrite_from + written;
            file.set_len(new_len)?;
            file.sync_all()?;
            Ok(new_len)
        };
        let new_len = match copy_back(&mut file, tmp.as_file_mut()) {
            Ok(n) => n,
            Err(e) => {
                let saved = tmp
                    .keep()
                    .map(|(_, p)| p)
                    .unwrap_or_else(|_| PathBuf::from("<lost>"));
                return Err(MxError::backend(
                    self.kind,
                    &path,
                    format!("write failed ({e}); unwritten messages saved in {}", saved.display()),
                ));
            }
        };

        for (msgno, loc) in layout {
            mb.records[msgno].content = loc;
        }
        let meta = file.metadata().map_err(|e| MxError::io(&path, e))?;
        lock.release();
        self.remember(mb, &meta);
        debug!(path = %path.display(), size = new_len, "Rewrote flat mailbox");
        Ok(())
    }

    fn close(&mut self, _mb: &mut Mailbox) {
        self.append = None;
        self.known = None;
    }

    fn check_empty(&self, path: &Path) -> Result<bool> {
        let meta = std::fs::metadata(path).map_err(|e| MxError::io(path, e))?;
        Ok(meta.len() == 0)
    }
}

/// Build a record out of the scanner's layout and header block.
fn record_from(scanned: ScannedMessage) -> MessageRecord {
    let summary = header::parse_header_block(&scanned.headers);
    let received = scanned
        .received
        .or(summary.date)
        .unwrap_or(DateTime::UNIX_EPOCH);
    let mut rec = MessageRecord::new(
        ContentLocation {
            start: scanned.start,
            hdr_offset: scanned.hdr_offset,
            offset: scanned.offset,
            length: scanned.length,
        },
        received,
        summary.envelope,
    );
    rec.date_sent = summary.date.unwrap_or(received);
    rec.flags.read = summary.status.read;
    rec.flags.old = summary.status.old;
    rec.flags.replied = summary.status.replied;
    rec.flags.flagged = summary.status.flagged;
    rec.flags.deleted = summary.status.deleted;
    rec
}

fn status_of(flags: &MessageFlags) -> StatusFlags {
    StatusFlags {
        read: flags.read,
        old: flags.old,
        replied: flags.replied,
        flagged: flags.flagged,
        deleted: false,
    }
}

/// Identity of a message across a reopen.
fn match_key(rec: &MessageRecord) -> String {
    match rec.envelope.message_id.as_deref() {
        Some(mid) => mid.to_string(),
        None => format!("@{}:{}", rec.content.start, rec.content.length),
    }
}

/// The header block of a raw message, without the blank line.
fn header_block(raw: &[u8]) -> &[u8] {
    match find_blank_line(raw) {
        Some(end) => &raw[..end],
        None => raw,
    }
}

/// Offset of the first byte after the header block.
fn find_blank_line(raw: &[u8]) -> Option<usize> {
    if raw.starts_with(b"\n") {
        return Some(0);
    }
    raw.windows(2).position(|w| w == b"\n\n").map(|i| i + 1)
}

/// Copy a header block (blank line included) replacing its status lines.
fn write_headers_with_status(out: &mut Vec<u8>, headers: &[u8], status: &StatusFlags) {
    let mut skipping = false;
    let mut wrote_status = false;
    for line in headers.split_inclusive(|&b| b == b'\n') {
        let blank = line == b"\n" || line == b"\r\n";
        if blank {
            if !wrote_status {
                out.extend_from_slice(header::render_status(status).as_bytes());
                wrote_status = true;
            }
            out.extend_from_slice(line);
            continue;
        }
        let continuation = matches!(line.first(), Some(b' ' | b'\t'));
        if continuation {
            if !skipping {
                out.extend_from_slice(line);
            }
            continue;
        }
        skipping = header::is_status_line(line);
        if !skipping {
            out.extend_from_slice(line);
        }
    }
    if !wrote_status {
        out.extend_from_slice(header::render_status(status).as_bytes());
    }
}

/// Write a new message: headers with fresh status, then the body, with
/// body lines starting with `From ` quoted when `escape_from` is set.
fn write_with_status(out: &mut Vec<u8>, raw: &[u8], status: &StatusFlags, escape_from: bool) {
    let (headers, body) = match find_blank_line(raw) {
        Some(end) => raw.split_at(end),
        None => (raw, &b""[..]),
    };
    let mut headers = headers.to_vec();
    if !headers.is_empty() && !headers.ends_with(b"\n") {
        headers.push(b'\n');
    }
    let body = match body.strip_prefix(b"\n") {
        Some(rest) => rest,
        None => body,
    };
    headers.push(b'\n');
    write_headers_with_status(out, &headers, status);

    for line in body.split_inclusive(|&b| b == b'\n') {
        if escape_from && scanner::is_mbox_separator(line) {
            out.push(b'>');
        }
        out.extend_from_slice(line);
    }
}

fn read_range(file: &File, from: u64, to: u64, buf: &mut Vec<u8>) -> io::Result<()> {
    buf.clear();
    buf.resize(to.saturating_sub(from) as usize, 0);
    file.read_exact_at(buf, from)
}

fn read_at_most(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut handle = file;
    handle.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match handle.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::config::Config;
    use crate::prompt::NonInteractive;
    use crate::session::{Flag, NewMessageOptions, OpenFlags};

    const THREE: &str = "From a@example.com Thu Jan  4 10:00:00 2024\n\
Message-ID: <1@example.com>\n\
Subject: one\n\
\n\
first body\n\
\n\
From b@example.com Thu Jan  4 11:00:00 2024\n\
Message-ID: <2@example.com>\n\
Subject: two\n\
Status: O\n\
\n\
second body\n\
\n\
From c@example.com Thu Jan  4 12:00:00 2024\n\
Message-ID: <3@example.com>\n\
Subject: three\n\
\n\
third body\n\
\n";

    fn open(path: &Path, config: &Config) -> (Mailbox, FlatBackend) {
        let mut prompt = NonInteractive;
        let stop = AtomicBool::new(false);
        let mut cx = Cx {
            config,
            prompt: &mut prompt,
            interrupt: &stop,
        };
        let mut mb = Mailbox::new(path, MailboxKind::Mbox, OpenFlags::default());
        let mut backend = FlatBackend::new(MailboxKind::Mbox);
        assert_eq!(backend.open(&mut mb, &mut cx).unwrap(), OpenOutcome::Complete);
        (mb, backend)
    }

    fn with_cx<T>(config: &Config, f: impl FnOnce(&mut Cx<'_>) -> T) -> T {
        let mut prompt = NonInteractive;
        let stop = AtomicBool::new(false);
        let mut cx = Cx {
            config,
            prompt: &mut prompt,
            interrupt: &stop,
        };
        f(&mut cx)
    }

    #[test]
    fn test_open_indexes_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox");
        std::fs::write(&path, THREE).unwrap();
        let config = Config::default();
        let (mut mb, mut backend) = open(&path, &config);

        assert_eq!(mb.msg_count(), 3);
        assert_eq!(mb.size(), THREE.len() as u64);
        assert_eq!(mb.counters().new, 2);
        assert_eq!(mb.counters().unread, 3);
        assert!(mb.records()[1].flags.old);

        let mut msg = backend.open_message(&mut mb, 1).unwrap();
        let mut text = String::new();
        msg.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("Message-ID: <2@example.com>"));
        assert!(text.ends_with("second body\n"));
    }

    #[test]
    fn test_sync_removes_deleted_and_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox");
        std::fs::write(&path, THREE).unwrap();
        let config = Config::default();
        let (mut mb, mut backend) = open(&path, &config);

        mb.set_flag(1, Flag::Delete, true).unwrap();
        mb.set_flag(2, Flag::Read, true).unwrap();
        with_cx(&config, |cx| backend.sync(&mut mb, cx)).unwrap();
        mb.update_tables(true);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("first body"));
        assert!(!text.contains("second body"));
        assert!(text.find("first body").unwrap() < text.find("third body").unwrap());
        assert!(text.contains("Subject: three\nStatus: RO\n\nthird body"));
        assert_eq!(mb.msg_count(), 2);

        // Offsets were moved along with the rewrite.
        let mut msg = backend.open_message(&mut mb, 1).unwrap();
        let mut body = String::new();
        msg.read_to_string(&mut body).unwrap();
        assert!(body.starts_with("Message-ID: <3@example.com>"));
        assert!(body.ends_with("third body\n"));
    }

    #[test]
    fn test_check_new_sees_appended_mail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox");
        std::fs::write(&path, THREE).unwrap();
        let config = Config::default();
        let (mut mb, mut backend) = open(&path, &config);

        assert_eq!(
            with_cx(&config, |cx| backend.check_new(&mut mb, cx)).unwrap(),
            CheckOutcome::Unchanged
        );

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"From d@example.com Thu Jan  4 13:00:00 2024\nSubject: four\n\nfourth\n\n")
            .unwrap();
        drop(f);

        assert_eq!(
            with_cx(&config, |cx| backend.check_new(&mut mb, cx)).unwrap(),
            CheckOutcome::NewMail
        );
        assert_eq!(mb.msg_count(), 4);
        assert_eq!(mb.counters().new, 3);
    }

    #[test]
    fn test_check_new_reopens_rewritten_file_keeping_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox");
        std::fs::write(&path, THREE).unwrap();
        let config = Config::default();
        let (mut mb, mut backend) = open(&path, &config);
        mb.set_flag(2, Flag::Flagged, true).unwrap();

        // Another client dropped the first message.
        let rest = &THREE[THREE.find("From b@").unwrap()..];
        std::fs::write(&path, rest).unwrap();

        assert_eq!(
            with_cx(&config, |cx| backend.check_new(&mut mb, cx)).unwrap(),
            CheckOutcome::Reopened
        );
        assert_eq!(mb.msg_count(), 2);
        assert!(mb.records()[1].flags.flagged);
        assert_eq!(mb.counters().flagged, 1);
        for (i, rec) in mb.records().iter().enumerate() {
            assert_eq!(mb.v2r()[rec.virtual_index.unwrap()], i);
        }
    }

    #[test]
    fn test_check_new_reopen_keeps_pending_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox");
        std::fs::write(&path, THREE).unwrap();
        let config = Config::default();
        let (mut mb, mut backend) = open(&path, &config);
        mb.set_flag(2, Flag::Delete, true).unwrap();
        mb.set_flag(2, Flag::Tag, true).unwrap();

        let rest = &THREE[THREE.find("From b@").unwrap()..];
        std::fs::write(&path, rest).unwrap();

        assert_eq!(
            with_cx(&config, |cx| backend.check_new(&mut mb, cx)).unwrap(),
            CheckOutcome::Reopened
        );
        assert_eq!(mb.msg_count(), 2);
        assert!(!mb.records()[0].flags.deleted);
        assert!(mb.records()[1].flags.deleted);
        assert!(mb.records()[1].flags.tagged);
        assert_eq!(mb.counters().deleted, 1);
        assert_eq!(mb.counters().tagged, 1);
    }

    #[test]
    fn test_sync_refuses_file_grown_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox");
        std::fs::write(&path, THREE).unwrap();
        let config = Config::default();
        let (mut mb, mut backend) = open(&path, &config);
        mb.set_flag(1, Flag::Delete, true).unwrap();

        // A header inserted into the first message shifts every offset.
        let edited = THREE.replacen("Subject: one\n", "Subject: one\nX-Label: later\n", 1);
        std::fs::write(&path, &edited).unwrap();

        let err = with_cx(&config, |cx| backend.sync(&mut mb, cx)).unwrap_err();
        assert!(matches!(err, MxError::Modified(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), edited);
        assert_eq!(mb.msg_count(), 3);
        assert!(mb.records()[1].flags.deleted);
        assert_eq!(mb.counters().deleted, 1);

        with_cx(&config, |cx| backend.sync(&mut mb, cx)).unwrap();
        mb.update_tables(true);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("X-Label: later\n"));
        assert!(!text.contains("second body"));
        assert!(text.contains("third body"));
        assert_eq!(mb.msg_count(), 2);
    }

    #[test]
    fn test_sync_keeps_mail_appended_meanwhile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox");
        std::fs::write(&path, THREE).unwrap();
        let config = Config::default();
        let (mut mb, mut backend) = open(&path, &config);
        mb.set_flag(0, Flag::Delete, true).unwrap();

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"From d@example.com Thu Jan  4 13:00:00 2024\nSubject: four\n\nfourth\n\n")
            .unwrap();
        drop(f);

        with_cx(&config, |cx| backend.sync(&mut mb, cx)).unwrap();
        mb.update_tables(true);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("first body"));
        assert!(text.contains("third body"));
        assert!(text.ends_with("fourth\n\n"));
        assert_eq!(mb.msg_count(), 3);
    }

    #[test]
    fn test_same_size_rewrite_counts_as_modified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox");
        std::fs::write(&path, THREE).unwrap();
        let config = Config::default();
        let (mut mb, mut backend) = open(&path, &config);

        std::fs::write(&path, THREE.replace("first body", "FIRST BODY")).unwrap();
        let when = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_500_000_000);
        crate::stamp::set_times(&path, when, when).unwrap();

        assert_eq!(
            with_cx(&config, |cx| backend.check_new(&mut mb, cx)).unwrap(),
            CheckOutcome::Reopened
        );
        let mut msg = backend.open_message(&mut mb, 0).unwrap();
        let mut text = String::new();
        msg.read_to_string(&mut text).unwrap();
        assert!(text.ends_with("FIRST BODY\n"));
    }

    #[test]
    fn test_append_writes_from_line_and_escapes_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved");
        let config = Config::default();

        let mut mb = Mailbox::new(&path, MailboxKind::Mbox, OpenFlags::default());
        let mut backend = FlatBackend::new(MailboxKind::Mbox);
        with_cx(&config, |cx| backend.open_append(&mut mb, cx, true)).unwrap();
        mb.append = true;
        mb.attach(Box::new(backend));

        let opts = NewMessageOptions {
            add_from: true,
            sender_fallback: Some("me@example.com".into()),
            ..NewMessageOptions::default()
        };
        let mut msg = mb.open_new_message(None, opts).unwrap();
        msg.write_all(b"Subject: hi\nStatus: RO\n\nFrom the start\nline\n").unwrap();
        mb.commit_message(&mut msg).unwrap();
        mb.close_message(msg).unwrap();
        mb.teardown();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("From me@example.com "));
        assert!(text.contains("Subject: hi\n\n>From the start\nline\n\n"));
        assert!(!text.contains("Status: RO"));
        assert!(!dir.path().join("saved.lock").exists());
    }

    #[test]
    fn test_mmdf_commit_wraps_in_separators() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("box.mmdf");
        let config = Config::default();

        let mut mb = Mailbox::new(&path, MailboxKind::Mmdf, OpenFlags::default());
        let mut backend = FlatBackend::new(MailboxKind::Mmdf);
        with_cx(&config, |cx| backend.open_append(&mut mb, cx, true)).unwrap();
        let mut msg = backend
            .open_new_message(&mut mb, NewMessage {
                flags: Default::default(),
                received: chrono::Utc::now(),
                from_line: None,
            })
            .unwrap();
        msg.write_all(b"Subject: m\n\nbody").unwrap();
        backend.commit_message(&mut mb, &mut msg).unwrap();
        backend.close(&mut mb);

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(MMDF_SEP));
        assert!(bytes.ends_with(b"body\n\x01\x01\x01\x01\n"));
    }

    #[test]
    fn test_check_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        let backend = FlatBackend::new(MailboxKind::Mbox);
        assert!(backend.check_empty(&path).unwrap());
        std::fs::write(&path, THREE).unwrap();
        assert!(!backend.check_empty(&path).unwrap());
        assert!(backend.check_empty(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_status_rewrite_replaces_folded_lines() {
        let mut out = Vec::new();
        let status = StatusFlags {
            read: true,
            old: true,
            flagged: true,
            ..StatusFlags::default()
        };
        write_headers_with_status(
            &mut out,
            b"Subject: x\nX-Status: A\n\tcontinued\nTo: y\n\n",
            &status,
        );
        assert_eq!(out, b"Subject: x\nTo: y\nStatus: RO\nX-Status: F\n\n");
    }
}
