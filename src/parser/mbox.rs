//! Streaming scanner for flat-file mailboxes (mbox and MMDF).
//!
//! Reads line by line and reports each message's byte layout together
//! with its raw header block. Never loads the whole file into memory.

use std::io::{self, BufRead};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::detect::MMDF_SEP;
use crate::parser::header::parse_from_line_date;

/// Separator convention of a flat file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Messages start at a `From ` envelope line.
    Mbox,
    /// Messages are wrapped in `^A^A^A^A` lines.
    Mmdf,
}

/// Byte layout of one message inside a flat file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScannedMessage {
    /// First byte of the separator.
    pub start: u64,
    /// First header byte.
    pub hdr_offset: u64,
    /// First body byte.
    pub offset: u64,
    /// Body length, excluding the trailing separator.
    pub length: u64,
    /// Date from the `From ` line, when there is one.
    pub received: Option<DateTime<Utc>>,
    /// Raw header lines (without the blank line that ends them).
    pub headers: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Headers,
    Body,
}

struct Open {
    msg: ScannedMessage,
    section: Section,
}

/// Scan `reader`, whose first byte sits at file offset `base`.
///
/// `on_message` returns `false` to stop early. Returns the number of
/// messages delivered and whether the scan ran to the end of input.
pub fn scan(
    reader: &mut dyn BufRead,
    flavor: Flavor,
    base: u64,
    on_message: &mut dyn FnMut(ScannedMessage) -> bool,
) -> io::Result<(u64, bool)> {
    let mut count: u64 = 0;
    let mut pos = base;
    let mut current: Option<Open> = None;
    let mut first_line = true;
    let mut prev_blank = true;
    let mut prev_len: u64 = 0;
    let mut line: Vec<u8> = Vec::with_capacity(4096);

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)? as u64;
        if n == 0 {
            break;
        }
        let line_start = pos;
        pos += n;

        match flavor {
            Flavor::Mbox => {
                let is_sep = is_mbox_separator(&line)
                    && (first_line || prev_blank || parse_from_line_date(&line).is_some());
                if is_sep {
                    if !first_line && !prev_blank {
                        warn!(offset = line_start, "Found 'From ' separator without preceding blank line");
                    }
                    if let Some(open) = current.take() {
                        let msg = finish(open, line_start, prev_blank, prev_len);
                        count += 1;
                        if !on_message(msg) {
                            return Ok((count, false));
                        }
                    }
                    current = Some(Open {
                        msg: ScannedMessage {
                            start: line_start,
                            hdr_offset: pos,
                            received: parse_from_line_date(&line),
                            ..ScannedMessage::default()
                        },
                        section: Section::Headers,
                    });
                } else if let Some(open) = current.as_mut() {
                    feed(open, &line, pos);
                }
            }
            Flavor::Mmdf => {
                if line == MMDF_SEP {
                    match current.take() {
                        Some(open) => {
                            let msg = finish(open, line_start, false, 0);
                            count += 1;
                            if !on_message(msg) {
                                return Ok((count, false));
                            }
                        }
                        None => {
                            current = Some(Open {
                                msg: ScannedMessage {
                                    start: line_start,
                                    hdr_offset: pos,
                                    ..ScannedMessage::default()
                                },
                                section: Section::Headers,
                            });
                        }
                    }
                } else if let Some(open) = current.as_mut() {
                    // An optional envelope line right after the opening separator.
                    if open.msg.hdr_offset == line_start && is_mbox_separator(&line) {
                        open.msg.received = parse_from_line_date(&line);
                        open.msg.hdr_offset = pos;
                    } else {
                        feed(open, &line, pos);
                    }
                } else if !is_blank_line(&line) {
                    warn!(offset = line_start, "Skipping text outside MMDF separators");
                }
            }
        }

        prev_blank = is_blank_line(&line);
        prev_len = n;
        first_line = false;
    }

    if let Some(open) = current.take() {
        if flavor == Flavor::Mmdf {
            warn!(offset = open.msg.start, "Unterminated MMDF message at end of file");
        }
        let trailing_blank = flavor == Flavor::Mbox && prev_blank;
        count += 1;
        on_message(finish(open, pos, trailing_blank, prev_len));
    }
    Ok((count, true))
}

fn feed(open: &mut Open, line: &[u8], pos: u64) {
    if open.section == Section::Headers {
        if is_blank_line(line) {
            open.msg.offset = pos;
            open.section = Section::Body;
        } else {
            open.msg.headers.extend_from_slice(line);
        }
    }
}

/// Close a message whose separator (or EOF) begins at `end`.
///
/// In mbox the blank line in front of the next `From ` belongs to the
/// separator, not to the body.
fn finish(mut open: Open, end: u64, prev_blank: bool, prev_len: u64) -> ScannedMessage {
    if open.section == Section::Headers {
        open.msg.offset = end;
        open.msg.length = 0;
        return open.msg;
    }
    let mut length = end - open.msg.offset;
    if prev_blank && end.saturating_sub(prev_len) >= open.msg.offset {
        length -= prev_len;
    }
    open.msg.length = length;
    open.msg
}

/// Check whether a line is an mbox separator (`From ` at the start).
pub fn is_mbox_separator(line: &[u8]) -> bool {
    line.starts_with(b"From ")
}

/// Check whether a line is blank (only CR / LF).
fn is_blank_line(line: &[u8]) -> bool {
    line.iter().all(|&b| b == b'\n' || b == b'\r')
}
