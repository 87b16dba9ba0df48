//! Integration tests for the mailbox lifecycle: open, flag, sync, close,
//! append and the copies made on the way out.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fs2::FileExt;
use tempfile::TempDir;

use mxshell::backend::CheckOutcome;
use mxshell::config::Config;
use mxshell::detect::MMDF_SEP;
use mxshell::lock::dotlock_path;
use mxshell::model::MailboxKind;
use mxshell::prompt::{Answer, QuadOption, ScriptedPrompt};
use mxshell::session::NewMessageOptions;
use mxshell::stamp::{set_times, FileStamp};
use mxshell::{CloseOutcome, CloseSummary, Flag, Mx, MxError, OpenFlags, SyncOutcome};

const THREE: &str = "From alice@example.com Mon Jan  1 10:00:00 2024\n\
Message-ID: <one@example.com>\n\
Subject: first\n\
\n\
body one\n\
\n\
From bob@example.com Tue Jan  2 10:00:00 2024\n\
Message-ID: <two@example.com>\n\
Subject: second\n\
\n\
body two\n\
\n\
From carol@example.com Wed Jan  3 10:00:00 2024\n\
Message-ID: <three@example.com>\n\
Subject: third\n\
\n\
body three\n";

fn config() -> Config {
    let mut config = Config::default();
    config.lock.attempts = 1;
    config.lock.poll_interval_ms = 5;
    config.mailbox.mark_old = false;
    config
}

fn mailbox(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, THREE).expect("write mailbox");
    path
}

fn subjects(mx: &mut Mx<'_>, path: &Path) -> Vec<String> {
    let mut mb = mx.open_mailbox(path, OpenFlags::readonly()).expect("reopen");
    let out = mb
        .records()
        .iter()
        .map(|r| r.envelope.real_subject.clone().unwrap_or_default())
        .collect();
    mx.fast_close(&mut mb);
    out
}

// ─── Purge on close ─────────────────────────────────────────────────

#[test]
fn test_close_purges_deleted_message() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let mut prompt = ScriptedPrompt::new([Answer::Yes]);
    let mut mx = Mx::new(config(), &mut prompt);

    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    assert_eq!(mb.msg_count(), 3);
    mb.set_flag(1, Flag::Delete, true).unwrap();

    let outcome = mx.close_mailbox(&mut mb).unwrap();
    assert_eq!(
        outcome,
        CloseOutcome::Saved(CloseSummary {
            kept: 2,
            moved: 0,
            deleted: 1
        })
    );
    assert!(mb.is_closed());
    assert_eq!(subjects(&mut mx, &path), ["first", "third"]);
    assert!(!dotlock_path(&path).exists());

    drop(mx);
    assert_eq!(prompt.asked().len(), 1);
    assert!(prompt.asked()[0].contains('1'));
}

#[test]
fn test_sync_keeps_session_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let mut cfg = config();
    cfg.mailbox.delete = QuadOption::Yes;
    let mut mx = Mx::non_interactive(cfg);

    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    mb.set_flag(0, Flag::Delete, true).unwrap();
    mb.set_flag(2, Flag::Flagged, true).unwrap();
    assert!(matches!(mx.sync_mailbox(&mut mb).unwrap(), SyncOutcome::Synced(_)));

    assert_eq!(mb.msg_count(), 2);
    assert_eq!(mb.counters().deleted, 0);
    assert_eq!(mb.counters().flagged, 1);
    assert!(!mb.counters().changed);
    for (i, rec) in mb.records().iter().enumerate() {
        assert_eq!(rec.msgno, i);
        let v = rec.virtual_index.expect("visible");
        assert_eq!(mb.v2r()[v], i);
    }

    // The rewritten offsets must still address the right bytes.
    let mut msg = mb.open_message(1).unwrap();
    let mut text = String::new();
    msg.read_to_string(&mut text).unwrap();
    assert!(text.contains("Subject: third"));
    assert!(text.contains("body three"));
    mb.close_message(msg).unwrap();

    assert_eq!(mx.sync_mailbox(&mut mb).unwrap(), SyncOutcome::Unchanged);
    mx.fast_close(&mut mb);
    assert_eq!(subjects(&mut mx, &path), ["second", "third"]);
}

// ─── Empty mailboxes ────────────────────────────────────────────────

#[test]
fn test_all_deleted_unlinks_flat_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "scratch");
    let mut cfg = config();
    cfg.mailbox.delete = QuadOption::Yes;
    cfg.mailbox.save_empty = false;
    let mut mx = Mx::non_interactive(cfg);

    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    for i in 0..3 {
        mb.set_flag(i, Flag::Delete, true).unwrap();
    }
    assert!(matches!(mx.close_mailbox(&mut mb).unwrap(), CloseOutcome::Saved(_)));
    assert!(!path.exists());
}

#[test]
fn test_all_deleted_spool_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "spool");
    let mut cfg = config();
    cfg.mailbox.delete = QuadOption::Yes;
    cfg.mailbox.save_empty = false;
    cfg.mailbox.spool = Some(path.clone());
    let mut mx = Mx::non_interactive(cfg);

    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    for i in 0..3 {
        mb.set_flag(i, Flag::Delete, true).unwrap();
    }
    mx.close_mailbox(&mut mb).unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    assert!(mx.is_empty(&path).unwrap());
}

#[test]
fn test_zero_byte_file_takes_default_kind() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty");
    fs::write(&path, "").unwrap();

    let mut cfg = config();
    cfg.set_default_kind("mmdf").unwrap();
    let mx = Mx::non_interactive(cfg);
    assert_eq!(mx.classify(&path).unwrap(), MailboxKind::Mmdf);

    let mut cfg = config();
    cfg.set_default_kind("maildir").unwrap();
    let mx = Mx::non_interactive(cfg);
    assert_eq!(mx.classify(&path).unwrap(), MailboxKind::Mbox);
}

// ─── Append ─────────────────────────────────────────────────────────

#[test]
fn test_append_creates_maildir_and_commits() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("archive");
    let mut cfg = config();
    cfg.set_default_kind("maildir").unwrap();
    let mut mx = Mx::non_interactive(cfg);

    let mut mb = mx.open_append(&target, OpenFlags::default()).unwrap();
    assert_eq!(mb.kind(), MailboxKind::Maildir);
    let mut msg = mb.open_new_message(None, NewMessageOptions::default()).unwrap();
    msg.write_all(b"Subject: hello\nMessage-ID: <hello@example.com>\n\nhi\n")
        .unwrap();
    mb.commit_message(&mut msg).unwrap();
    mb.close_message(msg).unwrap();
    mx.fast_close(&mut mb);

    for sub in ["cur", "new", "tmp"] {
        assert!(target.join(sub).is_dir());
    }
    assert_eq!(fs::read_dir(target.join("tmp")).unwrap().count(), 0);
    assert_eq!(fs::read_dir(target.join("new")).unwrap().count(), 1);
    assert_eq!(mx.classify(&target).unwrap(), MailboxKind::Maildir);
    assert_eq!(subjects(&mut mx, &target), ["hello"]);
}

#[test]
fn test_append_never_overwrites_unknown_file() {
    let dir = tempfile::tempdir().unwrap();
    let notes = dir.path().join("notes.txt");
    fs::write(&notes, "not mail\n").unwrap();
    let mut mx = Mx::non_interactive(config());
    let err = mx.open_append(&notes, OpenFlags::default()).unwrap_err();
    assert!(matches!(err, MxError::NotAMailbox(_)));
    assert_eq!(fs::read_to_string(&notes).unwrap(), "not mail\n");
}

#[test]
fn test_uncommitted_message_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let mut mx = Mx::non_interactive(config());

    let mut mb = mx.open_append(&path, OpenFlags::default()).unwrap();
    let mut msg = mb.open_new_message(None, NewMessageOptions::default()).unwrap();
    msg.write_all(b"Subject: never\n\nlost\n").unwrap();
    mb.close_message(msg).unwrap();
    mx.fast_close(&mut mb);

    assert_eq!(fs::read_to_string(&path).unwrap(), THREE);
}

#[test]
fn test_commit_requires_append_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let mut mx = Mx::non_interactive(config());
    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    let mut msg = mb.open_message(0).unwrap();
    assert!(matches!(mb.commit_message(&mut msg), Err(MxError::BadHandle(_))));
}

// ─── Peek ───────────────────────────────────────────────────────────

#[test]
fn test_peek_leaves_times_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let atime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    set_times(&path, atime, mtime).unwrap();

    let mut mx = Mx::non_interactive(config());
    let mut mb = mx.open_mailbox(&path, OpenFlags::peek()).unwrap();
    let mut msg = mb.open_message(2).unwrap();
    let mut body = Vec::new();
    msg.read_to_end(&mut body).unwrap();
    mb.close_message(msg).unwrap();
    mx.fast_close(&mut mb);

    let after = FileStamp::capture(&path).unwrap();
    assert_eq!(after.atime, atime);
    assert_eq!(after.mtime, mtime);
    assert!(!mx.is_notified(&path));
}

// ─── Close-abort atomicity ──────────────────────────────────────────

#[test]
fn test_declining_purge_keeps_every_message() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let mut prompt = ScriptedPrompt::new([Answer::No]);
    let mut mx = Mx::new(config(), &mut prompt);

    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    mb.set_flag(0, Flag::Delete, true).unwrap();
    mb.set_flag(2, Flag::Delete, true).unwrap();

    let outcome = mx.close_mailbox(&mut mb).unwrap();
    assert_eq!(
        outcome,
        CloseOutcome::Saved(CloseSummary {
            kept: 3,
            moved: 0,
            deleted: 0
        })
    );
    assert_eq!(subjects(&mut mx, &path), ["first", "second", "third"]);
}

fn spool_setup(dir: &TempDir) -> (PathBuf, PathBuf, Config) {
    let spool = mailbox(dir, "spool");
    let inbox = dir.path().join("read-mail");
    let mut cfg = config();
    cfg.mailbox.spool = Some(spool.clone());
    cfg.mailbox.inbox = Some(inbox.clone());
    cfg.mailbox.move_read = QuadOption::AskYes;
    (spool, inbox, cfg)
}

#[test]
fn test_aborting_relocation_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (spool, inbox, cfg) = spool_setup(&dir);
    let mut prompt = ScriptedPrompt::new([Answer::Abort]);
    let mut mx = Mx::new(cfg, &mut prompt);

    let mut mb = mx.open_mailbox(&spool, OpenFlags::default()).unwrap();
    mb.set_flag(0, Flag::Read, true).unwrap();
    mb.set_flag(1, Flag::Delete, true).unwrap();
    let before: Vec<_> = mb.records().iter().map(|r| r.flags).collect();
    let counters = *mb.counters();

    assert_eq!(mx.close_mailbox(&mut mb).unwrap(), CloseOutcome::Aborted);
    let after: Vec<_> = mb.records().iter().map(|r| r.flags).collect();
    assert_eq!(before, after);
    assert_eq!(counters, *mb.counters());
    assert!(!mb.is_closed());
    assert!(!inbox.exists());
    assert_eq!(fs::read_to_string(&spool).unwrap(), THREE);
    mx.fast_close(&mut mb);
}

#[test]
fn test_relocation_moves_read_messages() {
    let dir = tempfile::tempdir().unwrap();
    let (spool, inbox, cfg) = spool_setup(&dir);
    let mut prompt = ScriptedPrompt::new([Answer::Yes]);
    let mut mx = Mx::new(cfg, &mut prompt);

    let mut mb = mx.open_mailbox(&spool, OpenFlags::default()).unwrap();
    mb.set_flag(0, Flag::Read, true).unwrap();
    mb.set_flag(2, Flag::Read, true).unwrap();

    let outcome = mx.close_mailbox(&mut mb).unwrap();
    assert_eq!(
        outcome,
        CloseOutcome::Saved(CloseSummary {
            kept: 1,
            moved: 2,
            deleted: 0
        })
    );
    assert_eq!(subjects(&mut mx, &spool), ["second"]);
    assert_eq!(subjects(&mut mx, &inbox), ["first", "third"]);

    let mut moved = mx.open_mailbox(&inbox, OpenFlags::readonly()).unwrap();
    assert!(moved.records().iter().all(|r| r.flags.read));
    let mut msg = moved.open_message(0).unwrap();
    let mut text = String::new();
    msg.read_to_string(&mut text).unwrap();
    assert!(text.contains("body one"));
    moved.close_message(msg).unwrap();
    mx.fast_close(&mut moved);

    // The original envelope line travels with the message.
    let raw = fs::read_to_string(&inbox).unwrap();
    assert!(raw.starts_with("From alice@example.com Mon Jan  1 10:00:00 2024\n"));
}

// ─── Trash ──────────────────────────────────────────────────────────

#[test]
fn test_deleted_messages_go_to_trash() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let trash = dir.path().join("trash");
    let mut cfg = config();
    cfg.mailbox.delete = QuadOption::Yes;
    cfg.mailbox.trash = Some(trash.clone());
    let mut mx = Mx::non_interactive(cfg);

    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    mb.set_flag(0, Flag::Delete, true).unwrap();
    mb.set_flag(1, Flag::Delete, true).unwrap();
    mb.set_flag(1, Flag::Purge, true).unwrap();
    mx.close_mailbox(&mut mb).unwrap();

    assert_eq!(subjects(&mut mx, &path), ["third"]);
    assert_eq!(subjects(&mut mx, &trash), ["first"]);
}

#[test]
fn test_closing_the_trash_does_not_copy_into_itself() {
    let dir = tempfile::tempdir().unwrap();
    let trash = mailbox(&dir, "trash");
    let mut cfg = config();
    cfg.mailbox.delete = QuadOption::Yes;
    cfg.mailbox.trash = Some(trash.clone());
    let mut mx = Mx::non_interactive(cfg);

    let mut mb = mx.open_mailbox(&trash, OpenFlags::default()).unwrap();
    mb.set_flag(0, Flag::Delete, true).unwrap();
    mx.close_mailbox(&mut mb).unwrap();
    assert_eq!(subjects(&mut mx, &trash), ["second", "third"]);
}

// ─── New mail ───────────────────────────────────────────────────────

#[test]
fn test_check_sees_appended_mail() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let mut mx = Mx::non_interactive(config());
    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    assert_eq!(mx.check_mailbox(&mut mb).unwrap(), CheckOutcome::Unchanged);

    let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(
        b"\nFrom dave@example.com Thu Jan  4 10:00:00 2024\nSubject: fourth\n\nbody four\n",
    )
    .unwrap();
    drop(file);

    assert_eq!(mx.check_mailbox(&mut mb).unwrap(), CheckOutcome::NewMail);
    assert_eq!(mb.msg_count(), 4);
    assert_eq!(mb.counters().new, 4);
    mx.fast_close(&mut mb);
}

// ─── Locking ────────────────────────────────────────────────────────

#[test]
fn test_contended_sync_fails_without_leaking_locks() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let mut cfg = config();
    cfg.mailbox.delete = QuadOption::Yes;
    let mut mx = Mx::non_interactive(cfg);
    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    mb.set_flag(0, Flag::Delete, true).unwrap();

    let holder = fs::File::open(&path).unwrap();
    holder.lock_exclusive().unwrap();
    let err = mx.sync_mailbox(&mut mb).unwrap_err();
    assert!(err.is_lock_error());
    assert!(!dotlock_path(&path).exists());
    FileExt::unlock(&holder).unwrap();

    // Nothing was written and the session can try again.
    assert_eq!(fs::read_to_string(&path).unwrap(), THREE);
    assert_eq!(mb.counters().deleted, 1);
    assert!(matches!(mx.sync_mailbox(&mut mb).unwrap(), SyncOutcome::Synced(_)));
    mx.fast_close(&mut mb);
}

#[test]
fn test_refused_dotlock_releases_kernel_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    fs::write(dotlock_path(&path), "1@elsewhere\n").unwrap();

    let mut cfg = config();
    cfg.mailbox.delete = QuadOption::Yes;
    let mut prompt = ScriptedPrompt::new([Answer::No]);
    let mut mx = Mx::new(cfg, &mut prompt);
    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    mb.set_flag(2, Flag::Delete, true).unwrap();

    let err = mx.close_mailbox(&mut mb).unwrap_err();
    assert!(err.is_lock_error());
    assert!(!mb.is_closed());
    assert!(!mb.is_closing());

    let other = fs::File::open(&path).unwrap();
    other.try_lock_exclusive().expect("kernel lock is free");
    FileExt::unlock(&other).unwrap();
    assert_eq!(fs::read_to_string(dotlock_path(&path)).unwrap(), "1@elsewhere\n");
    mx.fast_close(&mut mb);
}

// ─── External rewrites ──────────────────────────────────────────────

#[test]
fn test_close_after_file_grew_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let mut prompt = ScriptedPrompt::new([Answer::Yes, Answer::Yes]);
    let mut mx = Mx::new(config(), &mut prompt);

    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    mb.set_flag(1, Flag::Delete, true).unwrap();

    // Another client marked the first message read.
    let edited = THREE.replacen("Subject: first\n", "Subject: first\nStatus: RO\n", 1);
    fs::write(&path, &edited).unwrap();

    let err = mx.close_mailbox(&mut mb).unwrap_err();
    assert!(matches!(err, MxError::Modified(_)));
    assert!(!mb.is_closed());
    assert_eq!(fs::read_to_string(&path).unwrap(), edited);
    assert_eq!(mb.counters().deleted, 1);

    let outcome = mx.close_mailbox(&mut mb).unwrap();
    assert_eq!(
        outcome,
        CloseOutcome::Saved(CloseSummary {
            kept: 2,
            moved: 0,
            deleted: 1,
        })
    );
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("Status: RO\n"));
    assert!(text.contains("body one"));
    assert!(!text.contains("body two"));
    assert!(text.contains("body three"));
}

#[test]
fn test_close_after_file_shrank() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let mut prompt = ScriptedPrompt::new([Answer::Yes, Answer::Yes]);
    let mut mx = Mx::new(config(), &mut prompt);

    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    mb.set_flag(2, Flag::Delete, true).unwrap();
    fs::write(&path, &THREE[THREE.find("From bob@").unwrap()..]).unwrap();

    assert!(matches!(mx.close_mailbox(&mut mb), Err(MxError::Modified(_))));
    assert_eq!(mb.msg_count(), 2);
    assert_eq!(mb.counters().deleted, 1);

    let outcome = mx.close_mailbox(&mut mb).unwrap();
    assert_eq!(
        outcome,
        CloseOutcome::Saved(CloseSummary {
            kept: 1,
            moved: 0,
            deleted: 1,
        })
    );
    assert_eq!(subjects(&mut mx, &path), ["second"]);
}

#[test]
fn test_close_after_same_size_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let mut prompt = ScriptedPrompt::new([Answer::Yes, Answer::Yes]);
    let mut mx = Mx::new(config(), &mut prompt);

    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    mb.set_flag(1, Flag::Delete, true).unwrap();

    fs::write(&path, THREE.replace("body one", "BODY ONE")).unwrap();
    let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_500_000_000);
    set_times(&path, when, when).unwrap();

    assert!(matches!(mx.close_mailbox(&mut mb), Err(MxError::Modified(_))));
    assert!(matches!(mx.close_mailbox(&mut mb), Ok(CloseOutcome::Saved(_))));
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("BODY ONE"));
    assert!(!text.contains("body two"));
    assert_eq!(subjects(&mut mx, &path), ["first", "third"]);
}

#[test]
fn test_check_reopen_keeps_pending_deletion() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let mut mx = Mx::non_interactive(config());

    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    mb.set_flag(2, Flag::Delete, true).unwrap();
    fs::write(&path, &THREE[THREE.find("From bob@").unwrap()..]).unwrap();

    assert_eq!(mx.check_mailbox(&mut mb).unwrap(), CheckOutcome::Reopened);
    assert_eq!(mb.msg_count(), 2);
    assert_eq!(mb.counters().deleted, 1);
    let deleted: Vec<_> = mb
        .records()
        .iter()
        .filter(|r| r.flags.deleted)
        .map(|r| r.envelope.real_subject.clone().unwrap_or_default())
        .collect();
    assert_eq!(deleted, ["third"]);
    mx.fast_close(&mut mb);
}

// ─── Purge in other formats ─────────────────────────────────────────

#[test]
fn test_mmdf_close_purges_deleted_message() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inbox.mmdf");
    let mut data = Vec::new();
    for (subject, body) in [("first", "body one"), ("second", "body two"), ("third", "body three")] {
        data.extend_from_slice(MMDF_SEP);
        data.extend_from_slice(format!("Subject: {subject}\n\n{body}\n").as_bytes());
        data.extend_from_slice(MMDF_SEP);
    }
    fs::write(&path, &data).unwrap();
    let mut prompt = ScriptedPrompt::new([Answer::Yes]);
    let mut mx = Mx::new(config(), &mut prompt);

    let mut mb = mx.open_mailbox(&path, OpenFlags::default()).unwrap();
    assert_eq!(mb.kind(), MailboxKind::Mmdf);
    mb.set_flag(1, Flag::Delete, true).unwrap();
    assert!(matches!(mx.close_mailbox(&mut mb), Ok(CloseOutcome::Saved(_))));

    let text = fs::read(&path).unwrap();
    assert!(text.starts_with(MMDF_SEP));
    assert_eq!(mx.classify(&path).unwrap(), MailboxKind::Mmdf);
    assert_eq!(subjects(&mut mx, &path), ["first", "third"]);
}

#[test]
fn test_mh_close_unlinks_deleted_message() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("mh");
    fs::create_dir(&folder).unwrap();
    fs::write(folder.join(".mh_sequences"), "").unwrap();
    for (n, subject) in [(1, "first"), (2, "second"), (3, "third")] {
        fs::write(folder.join(n.to_string()), format!("Subject: {subject}\n\nbody\n")).unwrap();
    }
    let mut prompt = ScriptedPrompt::new([Answer::Yes]);
    let mut mx = Mx::new(config(), &mut prompt);

    let mut mb = mx.open_mailbox(&folder, OpenFlags::default()).unwrap();
    assert_eq!(mb.kind(), MailboxKind::Mh);
    mb.set_flag(1, Flag::Delete, true).unwrap();
    assert!(matches!(mx.close_mailbox(&mut mb), Ok(CloseOutcome::Saved(_))));

    assert!(folder.join("1").exists());
    assert!(!folder.join("2").exists());
    assert!(folder.join("3").exists());
    assert_eq!(subjects(&mut mx, &folder), ["first", "third"]);
}

// ─── Peek during delivery ───────────────────────────────────────────

#[test]
fn test_peek_keeps_times_of_concurrent_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let path = mailbox(&dir, "inbox");
    let atime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    set_times(&path, atime, mtime).unwrap();

    let mut mx = Mx::non_interactive(config());
    let mut mb = mx.open_mailbox(&path, OpenFlags::peek()).unwrap();

    let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
    f.write_all(b"\nFrom dave@example.com Thu Jan  4 10:00:00 2024\nSubject: fourth\n\nbody four\n")
        .unwrap();
    drop(f);
    let delivered = SystemTime::UNIX_EPOCH + Duration::from_secs(1_800_000_000);
    set_times(&path, delivered, delivered).unwrap();

    mx.fast_close(&mut mb);
    let after = FileStamp::capture(&path).unwrap();
    assert_eq!(after.mtime, delivered);
}
