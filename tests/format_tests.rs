//! Integration tests for format detection, header reading and the
//! flat-file scanner.

use std::io::Cursor;

use assert_fs::prelude::*;
use predicates::prelude::*;

use mxshell::detect::{Detector, MMDF_SEP};
use mxshell::model::MailboxKind;
use mxshell::parser::header::{parse_header_block, render_status, StatusFlags};
use mxshell::parser::mbox::{scan, Flavor, ScannedMessage};

fn detector() -> Detector<'static> {
    Detector::new(MailboxKind::Mbox)
}

// ─── Test 1: Flat files by first line ───────────────────────────────

#[test]
fn test_detect_flat_files() {
    let temp = assert_fs::TempDir::new().unwrap();
    let mbox = temp.child("mbox");
    mbox.write_str("\n\nFrom a@b Mon Jan  1 00:00:00 2024\nSubject: x\n\nbody\n")
        .unwrap();
    let mmdf = temp.child("mmdf");
    mmdf.write_binary(&[MMDF_SEP, b"Subject: x\n\nbody\n", MMDF_SEP].concat())
        .unwrap();
    let notes = temp.child("notes.txt");
    notes.write_str("shopping list\n").unwrap();

    assert_eq!(detector().classify(mbox.path()).unwrap(), MailboxKind::Mbox);
    assert_eq!(detector().classify(mmdf.path()).unwrap(), MailboxKind::Mmdf);
    assert_eq!(detector().classify(notes.path()).unwrap(), MailboxKind::Unknown);
}

// ─── Test 2: Directories by shape ───────────────────────────────────

#[test]
fn test_detect_directories() {
    let temp = assert_fs::TempDir::new().unwrap();
    let maildir = temp.child("Maildir");
    for sub in ["cur", "new", "tmp"] {
        maildir.child(sub).create_dir_all().unwrap();
    }
    let mh = temp.child("mh");
    mh.create_dir_all().unwrap();
    mh.child(".mh_sequences").touch().unwrap();
    let plain = temp.child("plain");
    plain.create_dir_all().unwrap();

    assert_eq!(detector().classify(maildir.path()).unwrap(), MailboxKind::Maildir);
    assert_eq!(detector().classify(mh.path()).unwrap(), MailboxKind::Mh);
    assert_eq!(detector().classify(plain.path()).unwrap(), MailboxKind::Unknown);
}

// ─── Test 3: URLs and missing paths ─────────────────────────────────

#[test]
fn test_detect_urls_and_missing() {
    let temp = assert_fs::TempDir::new().unwrap();
    let d = detector();
    assert_eq!(
        d.classify(std::path::Path::new("imaps://mail.example.com/INBOX")).unwrap(),
        MailboxKind::Imap
    );
    assert_eq!(
        d.classify(std::path::Path::new("pop://mail.example.com")).unwrap(),
        MailboxKind::Pop
    );

    let missing = temp.child("nowhere");
    assert!(d.classify(missing.path()).is_err());
    missing.assert(predicate::path::missing());
}

// ─── Test 4: Sniffing leaves the file times alone ───────────────────

#[test]
fn test_detect_restores_times() {
    let temp = assert_fs::TempDir::new().unwrap();
    let mbox = temp.child("inbox");
    mbox.write_str("From a@b Mon Jan  1 00:00:00 2024\n\nbody\n").unwrap();
    let atime = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_500_000_000);
    let mtime = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000);
    mxshell::stamp::set_times(mbox.path(), atime, mtime).unwrap();

    detector().classify(mbox.path()).unwrap();
    let after = mxshell::stamp::FileStamp::capture(mbox.path()).unwrap();
    assert_eq!(after.atime, atime);
    assert_eq!(after.mtime, mtime);
    mbox.assert(predicate::str::starts_with("From "));
}

// ─── Test 5: Header block fields ────────────────────────────────────

#[test]
fn test_header_block_fields() {
    let raw = b"Return-Path: <bounce@example.com>\n\
From: Alice <alice@example.com>\n\
Subject: Re: Fwd: quarterly\n\
 numbers\n\
Message-ID: <q1@example.com>\n\
Supersedes: <q0@example.com>\n\
X-Label: work, urgent\n\
Status: RO\n\
X-Status: AF\n\
Date: Tue, 2 Jan 2024 09:30:00 +0100\n";
    let summary = parse_header_block(raw);
    assert_eq!(summary.envelope.message_id.as_deref(), Some("q1@example.com"));
    assert_eq!(summary.envelope.supersedes.as_deref(), Some("q0@example.com"));
    assert_eq!(summary.envelope.sender.as_deref(), Some("bounce@example.com"));
    assert!(predicate::str::contains("quarterly")
        .eval(summary.envelope.real_subject.as_deref().unwrap_or_default()));
    assert!(!summary.envelope.real_subject.unwrap_or_default().starts_with("Re:"));
    assert_eq!(summary.envelope.labels, ["work", "urgent"]);
    assert!(summary.status.read && summary.status.old);
    assert!(summary.status.replied && summary.status.flagged);
    assert!(summary.date.is_some());

    assert_eq!(render_status(&summary.status), "Status: RO\nX-Status: AF\n");
    assert_eq!(render_status(&StatusFlags::default()), "");
}

// ─── Test 6: Scanner layout ─────────────────────────────────────────

#[test]
fn test_scan_mbox_layout() {
    let data = "From a@b Mon Jan  1 00:00:00 2024\n\
Subject: one\n\
\n\
>From quoted\n\
\n\
From c@d Tue Jan  2 00:00:00 2024\n\
Subject: two\n\
\n\
last\n";
    let mut seen: Vec<ScannedMessage> = Vec::new();
    let (count, complete) = scan(&mut Cursor::new(data), Flavor::Mbox, 0, &mut |m| {
        seen.push(m);
        true
    })
    .unwrap();
    assert_eq!(count, 2);
    assert!(complete);

    let first = &seen[0];
    assert_eq!(first.start, 0);
    assert_eq!(&data[first.hdr_offset as usize..first.offset as usize], "Subject: one\n\n");
    assert_eq!(
        &data[first.offset as usize..(first.offset + first.length) as usize],
        ">From quoted\n"
    );
    assert!(first.received.is_some());
    assert_eq!(seen[1].headers, b"Subject: two\n");
}

#[test]
fn test_scan_stops_when_asked() {
    let data = "From a@b Mon Jan  1 00:00:00 2024\n\nx\n\n\
From c@d Tue Jan  2 00:00:00 2024\n\ny\n";
    let (count, complete) =
        scan(&mut Cursor::new(data), Flavor::Mbox, 0, &mut |_| false).unwrap();
    assert_eq!(count, 1);
    assert!(!complete);
}
