//! Maildir backend: one file per message under `cur/` and `new/`, with
//! flags encoded in the file name after `:2,`.
//!
//! New messages are written under `tmp/` and linked into place on commit,
//! so a reader never sees a partial file.

use std::collections::HashMap;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, BufRead, BufReader};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{Backend, CheckOutcome, Cx, Message, NewMessage, OpenOutcome, Operation};
use crate::error::{MxError, Result};
use crate::model::kind::MailboxKind;
use crate::model::record::{ContentLocation, MessageRecord};
use crate::parser::header;
use crate::session::Mailbox;
use crate::stamp;

/// Flags a maildir file name carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct NameFlags {
    draft: bool,
    flagged: bool,
    replied: bool,
    seen: bool,
    trashed: bool,
}

impl NameFlags {
    fn parse(name: &str) -> Self {
        let mut flags = Self::default();
        if let Some((_, info)) = name.split_once(":2,") {
            for c in info.chars() {
                match c {
                    'D' => flags.draft = true,
                    'F' => flags.flagged = true,
                    'R' => flags.replied = true,
                    'S' => flags.seen = true,
                    'T' => flags.trashed = true,
                    _ => {}
                }
            }
        }
        flags
    }

    /// Info suffix, letters in ASCII order.
    fn suffix(&self) -> String {
        let mut s = String::from(":2,");
        for (on, c) in [
            (self.draft, 'D'),
            (self.flagged, 'F'),
            (self.replied, 'R'),
            (self.seen, 'S'),
            (self.trashed, 'T'),
        ] {
            if on {
                s.push(c);
            }
        }
        s
    }
}

/// The unique part of a maildir file name (flags stripped).
fn base_name(name: &str) -> &str {
    name.split_once(':').map_or(name, |(base, _)| base)
}

/// One message file found on disk, relative to the mailbox.
struct Entry {
    rel: String,
    in_new: bool,
    flags: NameFlags,
}

/// Messages in `new/` then `cur/`, each sorted by name, keyed by base name.
fn list_entries(root: &Path) -> io::Result<Vec<(String, Entry)>> {
    let mut out = Vec::new();
    for sub in ["new", "cur"] {
        let mut names: Vec<String> = fs::read_dir(root.join(sub))?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort_unstable();
        for name in names {
            let base = base_name(&name).to_string();
            out.push((
                base,
                Entry {
                    rel: format!("{sub}/{name}"),
                    in_new: sub == "new",
                    flags: NameFlags::parse(&name),
                },
            ));
        }
    }
    Ok(out)
}

/// Read the header block of a single-message file and build its record.
///
/// Shared by the per-message-file backends.
pub(super) fn read_message_file(path: &Path, rel: &str) -> io::Result<MessageRecord> {
    let file = File::open(path)?;
    let meta = file.metadata()?;
    let mut reader = BufReader::new(file);
    let mut headers = Vec::new();
    let mut line = Vec::new();
    let mut offset = 0u64;
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        offset += n as u64;
        if line == b"\n" || line == b"\r\n" {
            break;
        }
        headers.extend_from_slice(&line);
    }

    let summary = header::parse_header_block(&headers);
    let received: DateTime<Utc> = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::UNIX_EPOCH);
    let mut rec = MessageRecord::new(
        ContentLocation {
            start: 0,
            hdr_offset: 0,
            offset,
            length: meta.len().saturating_sub(offset),
        },
        received,
        summary.envelope,
    );
    rec.date_sent = summary.date.unwrap_or(received);
    rec.path = Some(rel.to_string());
    Ok(rec)
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    match DirBuilder::new().mode(0o700).create(path) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        other => other,
    }
}

/// Backend for maildir folders.
pub struct MaildirBackend {
    /// Deliveries made by this instance, part of the unique name.
    deliveries: u64,
}

impl MaildirBackend {
    pub fn new() -> Self {
        Self { deliveries: 0 }
    }

    fn unique_name(&mut self) -> String {
        self.deliveries += 1;
        let secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let host = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
            .replace(['/', ':'], "_");
        format!("{secs}.P{}Q{}.{host}", std::process::id(), self.deliveries)
    }

    fn apply_entry(rec: &mut MessageRecord, entry: &Entry, maildir_trash: bool) {
        rec.flags.read = entry.flags.seen;
        rec.flags.flagged = entry.flags.flagged;
        rec.flags.replied = entry.flags.replied;
        rec.flags.old = !entry.in_new && !entry.flags.seen;
        rec.flags.deleted = maildir_trash && entry.flags.trashed;
        rec.path = Some(entry.rel.clone());
    }

    fn load(&self, mb: &mut Mailbox, entries: Vec<(String, Entry)>, cx: &Cx<'_>) -> Result<(usize, bool)> {
        let root = mb.path().to_path_buf();
        let trash = mb.maildir_trash;
        let mut pushed = 0;
        for (_, entry) in entries {
            let mut rec = match read_message_file(&root.join(&entry.rel), &entry.rel) {
                Ok(rec) => rec,
                // Moved away by another client since the listing.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(MxError::io(root.join(&entry.rel), e)),
            };
            Self::apply_entry(&mut rec, &entry, trash);
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

impl Default for MaildirBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MaildirBackend {
    fn kind(&self) -> MailboxKind {
        MailboxKind::Maildir
    }

    fn supports(&self, op: Operation) -> bool {
        !matches!(op, Operation::Catchup | Operation::FastCopy | Operation::Access)
    }

    fn open(&mut self, mb: &mut Mailbox, cx: &mut Cx<'_>) -> Result<OpenOutcome> {
        let root = mb.path().to_path_buf();
        let entries = list_entries(&root).map_err(|e| MxError::io(&root, e))?;
        let (pushed, complete) = self.load(mb, entries, cx)?;
        mb.update_context(pushed);
        debug!(path = %root.display(), messages = pushed, "Scanned maildir");
        Ok(if complete {
            OpenOutcome::Complete
        } else {
            OpenOutcome::Interrupted
        })
    }

    fn open_append(&mut self, mb: &mut Mailbox, _cx: &mut Cx<'_>, create: bool) -> Result<()> {
        let root = mb.path().to_path_buf();
        if create {
            create_private_dir(&root).map_err(|e| MxError::io(&root, e))?;
            for sub in ["cur", "new", "tmp"] {
                let dir = root.join(sub);
                create_private_dir(&dir).map_err(|e| MxError::io(&dir, e))?;
            }
            info!(path = %root.display(), "Created maildir");
        }
        let tmp = root.join("tmp");
        if !tmp.is_dir() {
            return Err(MxError::NotAMailbox(root));
        }
        Ok(())
    }

    fn open_new_message(&mut self, mb: &mut Mailbox, new: NewMessage) -> Result<Message> {
        loop {
            let temp = mb.path().join("tmp").join(self.unique_name());
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
        let rel = rec.path.as_deref().ok_or_else(|| {
            MxError::backend(MailboxKind::Maildir, mb.path(), "message has no file name")
        })?;
        let path = mb.path().join(rel);
        let file = File::open(&path).map_err(|e| MxError::io(&path, e))?;
        let mut msg = Message::reading_file(file, msgno, rec.received);
        msg.flags.read = rec.flags.read;
        msg.flags.flagged = rec.flags.flagged;
        msg.flags.replied = rec.flags.replied;
        Ok(msg)
    }

    fn commit_message(&mut self, mb: &mut Mailbox, msg: &mut Message) -> Result<()> {
        let temp = msg
            .temp_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| MxError::BadHandle("message has no temporary file".into()))?;
        if let Some(file) = msg.file() {
            file.sync_all().map_err(|e| MxError::io(&temp, e))?;
        }

        let flags = NameFlags {
            draft: msg.flags.draft,
            flagged: msg.flags.flagged,
            replied: msg.flags.replied,
            seen: msg.flags.read,
            trashed: false,
        };
        let (sub, suffix) = if flags == NameFlags::default() {
            ("new", String::new())
        } else {
            ("cur", flags.suffix())
        };

        let mut name = temp
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.unique_name());
        let dest = loop {
            let dest = mb.path().join(sub).join(format!("{name}{suffix}"));
            match fs::hard_link(&temp, &dest) {
                Ok(()) => break dest,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => name = self.unique_name(),
                Err(e) => return Err(MxError::io(&dest, e)),
            }
        };
        fs::remove_file(&temp).map_err(|e| MxError::io(&temp, e))?;

        let when = SystemTime::from(msg.received);
        if let Err(e) = stamp::set_times(&dest, when, when) {
            warn!(path = %dest.display(), error = %e, "Could not set delivery time");
        }
        debug!(path = %dest.display(), "Delivered maildir message");
        msg.mark_committed(Some(dest));
        Ok(())
    }

    fn check_new(&mut self, mb: &mut Mailbox, cx: &mut Cx<'_>) -> Result<CheckOutcome> {
        let root = mb.path().to_path_buf();
        let trash = mb.maildir_trash;
        let mut on_disk: HashMap<String, Entry> = list_entries(&root)
            .map_err(|e| MxError::io(&root, e))?
            .into_iter()
            .collect();

        let mut modified = false;
        for rec in &mut mb.records {
            let base = rec.path.as_deref().map(|p| base_name(p.rsplit('/').next().unwrap_or(p)).to_string());
            match base.and_then(|b| on_disk.remove(&b)) {
                None => {
                    rec.flags.active = false;
                    modified = true;
                }
                Some(entry) => {
                    // Unsaved local changes win over what another client wrote.
                    if !rec.flags.changed && rec.path.as_deref() != Some(entry.rel.as_str()) {
                        Self::apply_entry(rec, &entry, trash);
                        modified = true;
                    }
                }
            }
        }
        if modified {
            mb.update_tables(false);
        }

        let mut fresh: Vec<(String, Entry)> = on_disk.into_iter().collect();
        fresh.sort_by(|a, b| (!a.1.in_new, &a.1.rel).cmp(&(!b.1.in_new, &b.1.rel)));
        let (pushed, _) = self.load(mb, fresh, cx)?;
        mb.update_context(pushed);

        Ok(if modified {
            CheckOutcome::Reopened
        } else if pushed > 0 {
            CheckOutcome::NewMail
        } else {
            CheckOutcome::Unchanged
        })
    }

    fn sync(&mut self, mb: &mut Mailbox, _cx: &mut Cx<'_>) -> Result<()> {
        let root = mb.path().to_path_buf();
        let trash = mb.maildir_trash;
        let mut removed = 0usize;
        let mut renamed = 0usize;

        for rec in &mut mb.records {
            let Some(rel) = rec.path.clone() else {
                continue;
            };
            let current = root.join(&rel);

            if rec.flags.deleted && !trash {
                match fs::remove_file(&current) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(MxError::io(&current, e)),
                }
                continue;
            }

            let name = rel.rsplit('/').next().unwrap_or(&rel);
            let on_disk = NameFlags::parse(name);
            let wanted = NameFlags {
                draft: on_disk.draft,
                flagged: rec.flags.flagged,
                replied: rec.flags.replied,
                seen: rec.flags.read,
                trashed: trash && rec.flags.deleted,
            };
            if !rec.flags.changed && wanted == on_disk {
                continue;
            }

            let sub = if rec.flags.read || rec.flags.old || wanted != NameFlags::default() {
                "cur"
            } else {
                "new"
            };
            let suffix = if sub == "cur" {
                wanted.suffix()
            } else {
                String::new()
            };
            let new_rel = format!("{sub}/{}{suffix}", base_name(name));
            if new_rel != rel {
                let dest = root.join(&new_rel);
                fs::rename(&current, &dest).map_err(|e| MxError::io(&current, e))?;
                rec.path = Some(new_rel);
                renamed += 1;
            }
            rec.flags.changed = false;
        }

        mb.counters.changed = mb.records.iter().any(|r| r.flags.changed);
        debug!(path = %root.display(), removed, renamed, "Synchronized maildir");
        Ok(())
    }

    fn check_empty(&self, path: &Path) -> Result<bool> {
        for sub in ["new", "cur"] {
            let dir: PathBuf = path.join(sub);
            let mut entries = fs::read_dir(&dir).map_err(|e| MxError::io(&dir, e))?;
            let found = entries.any(|e| {
                e.ok()
                    .and_then(|e| e.file_name().into_string().ok())
                    .is_some_and(|name| !name.starts_with('.'))
            });
            if found {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::config::Config;
    use crate::prompt::NonInteractive;
    use crate::session::{Flag, OpenFlags};

    fn with_cx<T>(f: impl FnOnce(&mut Cx<'_>) -> T) -> T {
        let config = Config::default();
        let mut prompt = NonInteractive;
        let stop = AtomicBool::new(false);
        let mut cx = Cx {
            config: &config,
            prompt: &mut prompt,
            interrupt: &stop,
        };
        f(&mut cx)
    }

    fn make_maildir(root: &Path) {
        for sub in ["cur", "new", "tmp"] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }
        fs::write(root.join("new/100.a.host"), "Subject: fresh\n\nhello\n").unwrap();
        fs::write(root.join("cur/090.b.host:2,S"), "Subject: seen\n\nold news\n").unwrap();
        fs::write(root.join("cur/080.c.host:2,"), "Subject: skipped\n\nunread\n").unwrap();
    }

    fn open(root: &Path) -> (Mailbox, MaildirBackend) {
        let mut mb = Mailbox::new(root, MailboxKind::Maildir, OpenFlags::default());
        let mut backend = MaildirBackend::new();
        with_cx(|cx| backend.open(&mut mb, cx)).unwrap();
        (mb, backend)
    }

    #[test]
    fn test_name_flags() {
        let flags = NameFlags::parse("123.x.host:2,SRF");
        assert!(flags.seen && flags.replied && flags.flagged && !flags.trashed);
        assert_eq!(flags.suffix(), ":2,FRS");
        assert_eq!(base_name("123.x.host:2,S"), "123.x.host");
        assert_eq!(NameFlags::parse("123.x.host"), NameFlags::default());
    }

    #[test]
    fn test_open_reads_flags_from_names() {
        let dir = tempfile::tempdir().unwrap();
        make_maildir(dir.path());
        let (mb, _) = open(dir.path());

        assert_eq!(mb.msg_count(), 3);
        assert_eq!(mb.counters().unread, 2);
        assert_eq!(mb.counters().new, 1);
        let fresh = &mb.records()[0];
        assert_eq!(fresh.path.as_deref(), Some("new/100.a.host"));
        assert_eq!(fresh.envelope.real_subject.as_deref(), Some("fresh"));
        assert_eq!(fresh.content.length, 6);
    }

    #[test]
    fn test_sync_renames_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        make_maildir(dir.path());
        let (mut mb, mut backend) = open(dir.path());

        mb.set_flag(0, Flag::Read, true).unwrap();
        mb.set_flag(0, Flag::Flagged, true).unwrap();
        mb.set_flag(2, Flag::Delete, true).unwrap();
        with_cx(|cx| backend.sync(&mut mb, cx)).unwrap();

        assert!(dir.path().join("cur/100.a.host:2,FS").exists());
        assert!(!dir.path().join("new/100.a.host").exists());
        assert!(!dir.path().join("cur/090.b.host:2,S").exists());
        mb.update_tables(true);
        assert_eq!(mb.msg_count(), 2);
    }

    #[test]
    fn test_trash_flag_instead_of_unlink() {
        let dir = tempfile::tempdir().unwrap();
        make_maildir(dir.path());
        let mut mb = Mailbox::new(dir.path(), MailboxKind::Maildir, OpenFlags::default());
        mb.maildir_trash = true;
        let mut backend = MaildirBackend::new();
        with_cx(|cx| backend.open(&mut mb, cx)).unwrap();

        mb.set_flag(2, Flag::Delete, true).unwrap();
        with_cx(|cx| backend.sync(&mut mb, cx)).unwrap();
        assert!(dir.path().join("cur/090.b.host:2,ST").exists());
        mb.update_tables(true);
        assert_eq!(mb.msg_count(), 3);
        assert_eq!(mb.counters().deleted, 1);
    }

    #[test]
    fn test_check_new_tracks_arrivals_and_removals() {
        let dir = tempfile::tempdir().unwrap();
        make_maildir(dir.path());
        let (mut mb, mut backend) = open(dir.path());
        assert_eq!(
            with_cx(|cx| backend.check_new(&mut mb, cx)).unwrap(),
            CheckOutcome::Unchanged
        );

        fs::write(dir.path().join("new/200.d.host"), "Subject: later\n\nx\n").unwrap();
        assert_eq!(
            with_cx(|cx| backend.check_new(&mut mb, cx)).unwrap(),
            CheckOutcome::NewMail
        );
        assert_eq!(mb.msg_count(), 4);

        fs::remove_file(dir.path().join("cur/080.c.host:2,")).unwrap();
        assert_eq!(
            with_cx(|cx| backend.check_new(&mut mb, cx)).unwrap(),
            CheckOutcome::Reopened
        );
        assert_eq!(mb.msg_count(), 3);
        for (i, rec) in mb.records().iter().enumerate() {
            assert_eq!(rec.msgno, i);
        }
    }

    #[test]
    fn test_commit_links_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("box");
        let mut mb = Mailbox::new(&root, MailboxKind::Maildir, OpenFlags::default());
        let mut backend = MaildirBackend::new();
        with_cx(|cx| backend.open_append(&mut mb, cx, true)).unwrap();
        assert!(crate::detect::is_maildir(&root));

        let received = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        let mut msg = backend
            .open_new_message(
                &mut mb,
                NewMessage {
                    flags: crate::backend::HandleFlags {
                        read: true,
                        ..Default::default()
                    },
                    received,
                    from_line: None,
                },
            )
            .unwrap();
        let temp = msg.temp_path().unwrap().to_path_buf();
        msg.write_all(b"Subject: kept\n\nbody\n").unwrap();
        backend.commit_message(&mut mb, &mut msg).unwrap();

        let dest = msg.committed_path().unwrap().to_path_buf();
        assert!(!temp.exists());
        assert!(dest.to_string_lossy().ends_with(":2,S"));
        assert!(dest.parent().unwrap().ends_with("cur"));
        let mtime = fs::metadata(&dest).unwrap().modified().unwrap();
        assert_eq!(mtime, SystemTime::from(received));
        let mut text = String::new();
        File::open(&dest).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "Subject: kept\n\nbody\n");
        assert!(!backend.check_empty(&root).unwrap());
    }

    #[test]
    fn test_uncommitted_delivery_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("box");
        let mut mb = Mailbox::new(&root, MailboxKind::Maildir, OpenFlags::default());
        let mut backend = MaildirBackend::new();
        with_cx(|cx| backend.open_append(&mut mb, cx, true)).unwrap();
        let mut msg = backend
            .open_new_message(
                &mut mb,
                NewMessage {
                    flags: Default::default(),
                    received: Utc::now(),
                    from_line: None,
                },
            )
            .unwrap();
        msg.write_all(b"Subject: lost\n\n").unwrap();
        drop(msg);
        assert_eq!(fs::read_dir(root.join("tmp")).unwrap().count(), 0);
        assert!(backend.check_empty(&root).unwrap());
    }
}
