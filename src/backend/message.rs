//! Transient message handles.
//!
//! A handle opened for writing goes through `Writing -> Committed` or
//! `Writing -> Aborted`. Aborting removes the temporary file of a
//! per-message-file delivery, and dropping an uncommitted handle aborts it.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

/// Lifecycle of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Reading,
    Writing,
    Committed,
    Aborted,
}

/// Flags a new message carries into its target mailbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleFlags {
    pub read: bool,
    pub flagged: bool,
    pub replied: bool,
    pub draft: bool,
}

#[derive(Debug)]
enum Stream {
    File(File),
    Memory(Cursor<Vec<u8>>),
}

/// A read or write stream over a single message.
#[derive(Debug)]
pub struct Message {
    state: HandleState,
    stream: Stream,
    temp_path: Option<PathBuf>,
    committed_path: Option<PathBuf>,
    pub flags: HandleFlags,
    pub received: DateTime<Utc>,
    /// Envelope line for flat-file targets.
    pub from_line: Option<String>,
    /// Storage index of the message read, for read handles.
    pub msgno: Option<usize>,
}

impl Message {
    /// Read handle over an open file.
    pub fn reading_file(file: File, msgno: usize, received: DateTime<Utc>) -> Self {
        Self::reader(Stream::File(file), msgno, received)
    }

    /// Read handle over bytes already loaded.
    pub fn reading_bytes(bytes: Vec<u8>, msgno: usize, received: DateTime<Utc>) -> Self {
        Self::reader(Stream::Memory(Cursor::new(bytes)), msgno, received)
    }

    fn reader(stream: Stream, msgno: usize, received: DateTime<Utc>) -> Self {
        Self {
            state: HandleState::Reading,
            stream,
            temp_path: None,
            committed_path: None,
            flags: HandleFlags::default(),
            received,
            from_line: None,
            msgno: Some(msgno),
        }
    }

    /// Write handle buffering the message in memory until commit.
    pub fn writing_memory(flags: HandleFlags, received: DateTime<Utc>) -> Self {
        Self::writer(Stream::Memory(Cursor::new(Vec::new())), None, flags, received)
    }

    /// Write handle over a temporary file that commit renames into place.
    pub fn writing_file(
        file: File,
        temp_path: PathBuf,
        flags: HandleFlags,
        received: DateTime<Utc>,
    ) -> Self {
        Self::writer(Stream::File(file), Some(temp_path), flags, received)
    }

    fn writer(
        stream: Stream,
        temp_path: Option<PathBuf>,
        flags: HandleFlags,
        received: DateTime<Utc>,
    ) -> Self {
        Self {
            state: HandleState::Writing,
            stream,
            temp_path,
            committed_path: None,
            flags,
            received,
            from_line: None,
            msgno: None,
        }
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn is_writable(&self) -> bool {
        self.state == HandleState::Writing
    }

    pub fn temp_path(&self) -> Option<&Path> {
        self.temp_path.as_deref()
    }

    /// Final location after a commit, for per-message-file kinds.
    pub fn committed_path(&self) -> Option<&Path> {
        self.committed_path.as_deref()
    }

    /// The underlying file, when the handle is file-backed.
    pub fn file(&self) -> Option<&File> {
        match &self.stream {
            Stream::File(file) => Some(file),
            Stream::Memory(_) => None,
        }
    }

    /// Everything in the stream, from the start.
    pub fn contents(&mut self) -> io::Result<Vec<u8>> {
        match &mut self.stream {
            Stream::Memory(cursor) => Ok(cursor.get_ref().clone()),
            Stream::File(file) => {
                file.seek(SeekFrom::Start(0))?;
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }

    /// Record a successful commit. The temporary file has been moved away.
    pub fn mark_committed(&mut self, final_path: Option<PathBuf>) {
        self.temp_path = None;
        self.committed_path = final_path;
        self.state = HandleState::Committed;
    }

    /// Give up on a write handle, removing its temporary file.
    pub fn abort(&mut self) {
        if self.state != HandleState::Writing {
            return;
        }
        if let Some(path) = self.temp_path.take() {
            debug!(path = %path.display(), "Removing uncommitted message");
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Could not remove temporary message");
                }
            }
        }
        self.state = HandleState::Aborted;
    }
}

impl Read for Message {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            Stream::File(file) => file.read(buf),
            Stream::Memory(cursor) => cursor.read(buf),
        }
    }
}

impl Write for Message {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.state != HandleState::Writing {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "message handle is not open for writing",
            ));
        }
        match &mut self.stream {
            Stream::File(file) => file.write(buf),
            Stream::Memory(cursor) => cursor.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stream {
            Stream::File(file) => file.flush(),
            Stream::Memory(_) => Ok(()),
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        self.abort();
    }
}
