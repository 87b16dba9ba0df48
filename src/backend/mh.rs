//! MH backend: numbered message files in one directory, with unseen,
//! flagged and replied state kept in `.mh_sequences`.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use tracing::{debug, info};

use super::maildir::read_message_file;
use super::{Backend, CheckOutcome, Cx, Message, NewMessage, OpenOutcome, Operation};
use crate::error::{MxError, Result};
use crate::lock::{LockHandle, LockRequest, LockSettings};
use crate::model::kind::MailboxKind;
use crate::model::record::MessageRecord;
use crate::prompt::NonInteractive;
use crate::session::Mailbox;

const SEQUENCES: &str = ".mh_sequences";

/// Sequences this backend maintains; other lines are kept as they are.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Sequences {
    unseen: BTreeSet<u32>,
    flagged: BTreeSet<u32>,
    replied: BTreeSet<u32>,
    other: Vec<String>,
}

impl Sequences {
    fn load(dir: &Path) -> io::Result<Self> {
        match fs::read_to_string(dir.join(SEQUENCES)) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    fn parse(text: &str) -> Self {
        let mut seqs = Self::default();
        for line in text.lines() {
            let Some((name, list)) = line.split_once(':') else {
                continue;
            };
            let target = match name.trim() {
                "unseen" => &mut seqs.unseen,
                "flagged" => &mut seqs.flagged,
                "replied" => &mut seqs.replied,
                _ => {
                    seqs.other.push(line.to_string());
                    continue;
                }
            };
            for item in list.split_whitespace() {
                match item.split_once('-') {
                    Some((a, b)) => {
                        if let (Ok(a), Ok(b)) = (a.parse::<u32>(), b.parse::<u32>()) {
                            target.extend(a..=b);
                        }
                    }
                    None => {
                        if let Ok(n) = item.parse::<u32>() {
                            target.insert(n);
                        }
                    }
                }
            }
        }
        seqs
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (name, set) in [
            ("unseen", &self.unseen),
            ("flagged", &self.flagged),
            ("replied", &self.replied),
        ] {
            if set.is_empty() {
                continue;
            }
            out.push_str(name);
            out.push(':');
            for (a, b) in ranges(set) {
                if a == b {
                    let _ = write!(out, " {a}");
                } else {
                    let _ = write!(out, " {a}-{b}");
                }
            }
            out.push('\n');
        }
        for line in &self.other {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    fn set(&mut self, n: u32, unseen: bool, flagged: bool, replied: bool) {
        for (set, on) in [
            (&mut self.unseen, unseen),
            (&mut self.flagged, flagged),
            (&mut self.replied, replied),
        ] {
            if on {
                set.insert(n);
            } else {
                set.remove(&n);
            }
        }
    }
}

/// Collapse a sorted set into inclusive runs.
fn ranges(set: &BTreeSet<u32>) -> Vec<(u32, u32)> {
    let mut out: Vec<(u32, u32)> = Vec::new();
    for &n in set {
        match out.last_mut() {
            Some((_, end)) if end.checked_add(1) == Some(n) => *end = n,
            _ => out.push((n, n)),
        }
    }
    out
}

/// Message numbers present in `dir`, ascending.
fn message_numbers(dir: &Path) -> io::Result<Vec<u32>> {
    let mut numbers: Vec<u32> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|name| name.parse().ok())
        .collect();
    numbers.sort_unstable();
    Ok(numbers)
}

fn number_of(rec: &MessageRecord) -> Option<u32> {
    rec.path.as_deref().and_then(|p| p.parse().ok())
}

/// Backend for MH folders.
pub struct MhBackend {
    settings: LockSettings,
    temps: u64,
}

impl MhBackend {
    pub fn new() -> Self {
        Self {
            settings: LockSettings::default(),
            temps: 0,
        }
    }

    /// Rewrite `.mh_sequences` under an exclusive lock.
    fn store_sequences(&self, dir: &Path, edit: impl FnOnce(&mut Sequences)) -> Result<()> {
        let path = dir.join(SEQUENCES);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| MxError::io(&path, e))?;
        let lock = LockHandle::acquire(
            &path,
            &file,
            LockRequest::exclusive().with_retry(true),
            &self.settings,
            &mut NonInteractive,
        )?;

        let mut seqs = Sequences::load(dir).map_err(|e| MxError::io(&path, e))?;
        edit(&mut seqs);
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| MxError::io(dir, e))?;
        tmp.write_all(seqs.render().as_bytes())
            .map_err(|e| MxError::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| MxError::io(&path, e.error))?;
        lock.release();
        Ok(())
    }

    fn load(
        &self,
        mb: &mut Mailbox,
        numbers: &[u32],
        seqs: &Sequences,
        cx: &Cx<'_>,
    ) -> Result<(usize, bool)> {
        let dir = mb.path().to_path_buf();
        let mut pushed = 0;
        for &n in numbers {
            let rel = n.to_string();
            let mut rec = match read_message_file(&dir.join(&rel), &rel) {
                Ok(rec) => rec,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(MxError::io(dir.join(&rel), e)),
            };
            rec.flags.read = !seqs.unseen.contains(&n);
            rec.flags.flagged = seqs.flagged.contains(&n);
            rec.flags.replied = seqs.replied.contains(&n);
            mb.counters.size += rec.content.size();
            mb.push_record(rec)?;
            pushed += 1;
            if cx.interrupted() {
                return Ok((pushed, false));
            }
        }
        Ok((pushed, true))
    }
}

impl Default for MhBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MhBackend {
    fn kind(&self) -> MailboxKind {
        MailboxKind::Mh
    }

    fn supports(&self, op: Operation) -> bool {
        !matches!(op, Operation::Catchup | Operation::FastCopy | Operation::Access)
    }

    fn open(&mut self, mb: &mut Mailbox, cx: &mut Cx<'_>) -> Result<OpenOutcome> {
        self.settings = cx.lock_settings();
        let dir = mb.path().to_path_buf();
        let numbers = message_numbers(&dir).map_err(|e| MxError::io(&dir, e))?;
        let seqs = Sequences::load(&dir).map_err(|e| MxError::io(dir.join(SEQUENCES), e))?;
        let (pushed, complete) = self.load(mb, &numbers, &seqs, cx)?;
        mb.update_context(pushed);
        debug!(path = %dir.display(), messages = pushed, "Scanned MH folder");
        Ok(if complete {
            OpenOutcome::Complete
        } else {
            OpenOutcome::Interrupted
        })
    }

    fn open_append(&mut self, mb: &mut Mailbox, cx: &mut Cx<'_>, create: bool) -> Result<()> {
        self.settings = cx.lock_settings();
        let dir = mb.path().to_path_buf();
        if create {
            match DirBuilder::new().mode(0o700).create(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(MxError::io(&dir, e)),
            }
            let seq = dir.join(SEQUENCES);
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&seq)
                .map_err(|e| MxError::io(&seq, e))?;
            info!(path = %dir.display(), "Created MH folder");
        }
        if !dir.is_dir() {
            return Err(MxError::NotAMailbox(dir));
        }
        Ok(())
    }

    fn open_new_message(&mut self, mb: &mut Mailbox, new: NewMessage) -> Result<Message> {
        loop {
            self.temps += 1;
            let temp = mb
                .path()
                .join(format!(".mxshell-{}-{}", std::process::id(), self.temps));
            match OpenOptions::new().write(true).read(true).create_new(true).open(&temp) {
                Ok(file) => return Ok(Message::writing_file(file, temp, new.flags, new.received)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(MxError::io(&temp, e)),
            }
        }
    }

    fn open_message(&mut self, mb: &mut Mailbox, msgno: usize) -> Result<Message> {
        let rec = mb
            .record(msgno)
            .ok_or_else(|| MxError::BadHandle(format!("no message number {}", msgno + 1)))?;
        let rel = rec
            .path
            .as_deref()
            .ok_or_else(|| MxError::backend(MailboxKind::Mh, mb.path(), "message has no number"))?;
        let path = mb.path().join(rel);
        let file = File::open(&path).map_err(|e| MxError::io(&path, e))?;
        let mut msg = Message::reading_file(file, msgno, rec.received);
        msg.flags.read = rec.flags.read;
        msg.flags.flagged = rec.flags.flagged;
        msg.flags.replied = rec.flags.replied;
        Ok(msg)
    }

    fn commit_message(&mut self, mb: &mut Mailbox, msg: &mut Message) -> Result<()> {
        let dir = mb.path().to_path_buf();
        let temp = msg
            .temp_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| MxError::BadHandle("message has no temporary file".into()))?;
        if let Some(file) = msg.file() {
            file.sync_all().map_err(|e| MxError::io(&temp, e))?;
        }

        let mut n = message_numbers(&dir)
            .map_err(|e| MxError::io(&dir, e))?
            .last()
            .copied()
            .unwrap_or(0);
        let dest = loop {
            n += 1;
            let dest = dir.join(n.to_string());
            match fs::hard_link(&temp, &dest) {
                Ok(()) => break dest,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(MxError::io(&dest, e)),
            }
        };
        fs::remove_file(&temp).map_err(|e| MxError::io(&temp, e))?;

        let flags = msg.flags;
        self.store_sequences(&dir, |seqs| {
            seqs.set(n, !flags.read, flags.flagged, flags.replied)
        })?;
        debug!(path = %dest.display(), "Delivered MH message");
        msg.mark_committed(Some(dest));
        Ok(())
    }

    fn check_new(&mut self, mb: &mut Mailbox, cx: &mut Cx<'_>) -> Result<CheckOutcome> {
        let dir = mb.path().to_path_buf();
        let numbers = message_numbers(&dir).map_err(|e| MxError::io(&dir, e))?;
        let seqs = Sequences::load(&dir).map_err(|e| MxError::io(dir.join(SEQUENCES), e))?;
        let mut present: BTreeSet<u32> = numbers.iter().copied().collect();

        let mut modified = false;
        for rec in &mut mb.records {
            match number_of(rec) {
                Some(n) if present.remove(&n) => {
                    if !rec.flags.changed {
                        let read = !seqs.unseen.contains(&n);
                        let flagged = seqs.flagged.contains(&n);
                        let replied = seqs.replied.contains(&n);
                        if (read, flagged, replied)
                            != (rec.flags.read, rec.flags.flagged, rec.flags.replied)
                        {
                            rec.flags.read = read;
                            rec.flags.flagged = flagged;
                            rec.flags.replied = replied;
                            modified = true;
                        }
                    }
                }
                _ => {
                    rec.flags.active = false;
                    modified = true;
                }
            }
        }
        if modified {
            mb.update_tables(false);
        }

        let fresh: Vec<u32> = present.into_iter().collect();
        let (pushed, _) = self.load(mb, &fresh, &seqs, cx)?;
        mb.update_context(pushed);

        Ok(if modified {
            CheckOutcome::Reopened
        } else if pushed > 0 {
            CheckOutcome::NewMail
        } else {
            CheckOutcome::Unchanged
        })
    }

    fn sync(&mut self, mb: &mut Mailbox, cx: &mut Cx<'_>) -> Result<()> {
        self.settings = cx.lock_settings();
        let dir = mb.path().to_path_buf();
        let mut removed = 0usize;

        for rec in mb.records.iter().filter(|r| r.flags.deleted) {
            let Some(rel) = rec.path.as_deref() else {
                continue;
            };
            let path = dir.join(rel);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(MxError::io(&path, e)),
            }
        }

        let mut states = Vec::with_capacity(mb.records.len());
        for rec in mb.records.iter().filter(|r| !r.flags.deleted) {
            if let Some(n) = number_of(rec) {
                states.push((n, !rec.flags.read, rec.flags.flagged, rec.flags.replied));
            }
        }
        let deleted: Vec<u32> = mb
            .records
            .iter()
            .filter(|r| r.flags.deleted)
            .filter_map(number_of)
            .collect();
        self.store_sequences(&dir, |seqs| {
            for n in deleted {
                seqs.set(n, false, false, false);
            }
            for (n, unseen, flagged, replied) in states {
                seqs.set(n, unseen, flagged, replied);
            }
        })?;

        for rec in mb.records.iter_mut().filter(|r| !r.flags.deleted) {
            rec.flags.changed = false;
        }
        mb.counters.changed = false;
        debug!(path = %dir.display(), removed, "Synchronized MH folder");
        Ok(())
    }

    fn check_empty(&self, path: &Path) -> Result<bool> {
        let numbers = message_numbers(path).map_err(|e| MxError::io(path, e))?;
        Ok(numbers.is_empty())
    }
}
