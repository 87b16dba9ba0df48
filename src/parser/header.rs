//! RFC 5322 header reading: folding, the few fields the session indexes,
//! and mailbox status headers.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::debug;

use crate::model::record::EnvelopeRef;

/// Status flags stored in `Status:` / `X-Status:` headers of flat files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub read: bool,
    pub old: bool,
    pub replied: bool,
    pub flagged: bool,
    pub deleted: bool,
}

/// What the session needs to know about one header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSummary {
    pub envelope: EnvelopeRef,
    pub date: Option<DateTime<Utc>>,
    pub status: StatusFlags,
}

/// Read the indexed fields out of a raw header block.
pub fn parse_header_block(raw: &[u8]) -> HeaderSummary {
    let text = decode_header_bytes(raw);
    let headers = unfold_headers(&text);

    let message_id = get_header(&headers, "message-id").map(|v| extract_angle_bracket(&v));
    let supersedes = get_header(&headers, "supersedes").map(|v| extract_angle_bracket(&v));
    let real_subject = get_header(&headers, "subject").map(|v| strip_reply_prefix(&v));
    let sender = ["return-path", "sender", "from"]
        .iter()
        .filter_map(|name| get_header(&headers, name))
        .map(|v| mailbox_address(&v))
        .find(|addr| !addr.is_empty());
    let labels = headers
        .iter()
        .filter(|(k, _)| k == "x-label")
        .flat_map(|(_, v)| {
            v.split([',', ' '])
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect();

    let date = get_header(&headers, "date").and_then(|v| parse_date(&v));
    let status = parse_status(
        get_header(&headers, "status").as_deref(),
        get_header(&headers, "x-status").as_deref(),
    );

    HeaderSummary {
        envelope: EnvelopeRef {
            message_id,
            real_subject,
            supersedes,
            sender,
            labels,
        },
        date,
        status,
    }
}

/// Interpret `Status:` (`R` read, `O` old) and `X-Status:` (`A` replied,
/// `F` flagged, `D` deleted).
pub fn parse_status(status: Option<&str>, x_status: Option<&str>) -> StatusFlags {
    let mut flags = StatusFlags::default();
    for c in status.unwrap_or_default().chars() {
        match c {
            'R' => flags.read = true,
            'O' => flags.old = true,
            _ => {}
        }
    }
    for c in x_status.unwrap_or_default().chars() {
        match c {
            'A' => flags.replied = true,
            'F' => flags.flagged = true,
            'D' => flags.deleted = true,
            _ => {}
        }
    }
    flags
}

/// Render status headers for a flat-file message, each line terminated.
pub fn render_status(flags: &StatusFlags) -> String {
    let mut out = String::new();
    if flags.read {
        out.push_str("Status: RO\n");
    } else if flags.old {
        out.push_str("Status: O\n");
    }
    if flags.replied || flags.flagged {
        out.push_str("X-Status: ");
        if flags.replied {
            out.push('A');
        }
        if flags.flagged {
            out.push('F');
        }
        out.push('\n');
    }
    out
}

/// Whether a raw header line carries mailbox status that a rewrite replaces.
pub fn is_status_line(line: &[u8]) -> bool {
    let lower: Vec<u8> = line
        .iter()
        .take(16)
        .map(|b| b.to_ascii_lowercase())
        .collect();
    lower.starts_with(b"status:")
        || lower.starts_with(b"x-status:")
        || lower.starts_with(b"content-length:")
        || lower.starts_with(b"lines:")
}

/// Drop `Re:`/`Fwd:` style prefixes, leaving the subject used for threading.
pub fn strip_reply_prefix(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lower = s.to_ascii_lowercase();
        let cut = ["re:", "fwd:", "fw:", "aw:", "sv:"]
            .iter()
            .find(|p| lower.starts_with(*p))
            .map(|p| p.len());
        match cut {
            Some(n) => s = s[n..].trim_start(),
            None => return s.to_string(),
        }
    }
}

/// Decode raw header bytes to a string.
///
/// UTF-8 when valid, otherwise Windows-1252 (accepts every byte).
fn decode_header_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Join continuation lines onto their header.
///
/// Returns `(lowercase_name, value)` pairs in order.
fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            // "From " envelope lines have no colon before the space.
            if name.contains(' ') {
                continue;
            }
            result.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }
    result
}

fn get_header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

fn extract_angle_bracket(s: &str) -> String {
    let trimmed = s.trim();
    if let Some(start) = trimmed.find('<') {
        if let Some(end) = trimmed[start..].find('>') {
            return trimmed[start..start + end + 1].to_string();
        }
    }
    trimmed.to_string()
}

/// Bare address out of `Name <addr>` or `addr (comment)`.
fn mailbox_address(value: &str) -> String {
    let bracketed = extract_angle_bracket(value);
    let bare = bracketed.trim_start_matches('<').trim_end_matches('>');
    bare.split_whitespace().next().unwrap_or_default().to_string()
}

/// Parse a `Date:` value. Tolerates a missing weekday and named zones.
pub fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    let trimmed = date_str.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    let no_dow = match trimmed.split_once([',', ' ']) {
        Some((day, rest)) if day.len() == 3 && day.chars().all(|c| c.is_ascii_alphabetic()) => {
            rest.trim()
        }
        _ => trimmed,
    };
    let candidate = with_numeric_zone(no_dow);
    for fmt in ["%d %b %Y %H:%M:%S %z", "%d %b %Y %H:%M %z"] {
        if let Ok(dt) = DateTime::parse_from_str(&candidate, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%d %b %Y %H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(no_dow, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }

    debug!(date = trimmed, "Could not parse date");
    None
}

fn with_numeric_zone(s: &str) -> String {
    const ZONES: [(&str, &str); 10] = [
        ("UT", "+0000"),
        ("GMT", "+0000"),
        ("UTC", "+0000"),
        ("EST", "-0500"),
        ("EDT", "-0400"),
        ("CST", "-0600"),
        ("CDT", "-0500"),
        ("PST", "-0800"),
        ("PDT", "-0700"),
        ("CET", "+0100"),
    ];
    if let Some((head, zone)) = s.rsplit_once(' ') {
        if let Some((_, offset)) = ZONES.iter().find(|(name, _)| *name == zone) {
            return format!("{head} {offset}");
        }
    }
    s.to_string()
}

/// Parse the date out of an mbox `From ` envelope line
/// (`From sender Mon Jan  1 00:00:00 2024`).
pub fn parse_from_line_date(line: &[u8]) -> Option<DateTime<Utc>> {
    let text = std::str::from_utf8(line).ok()?;
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() < 6 || tokens[0] != "From" {
        return None;
    }
    // Weekday onwards; some writers put a zone before the year.
    let rest = tokens[2..].join(" ");
    for fmt in ["%a %b %d %H:%M:%S %Y", "%a %b %d %H:%M %Y"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&rest, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }
    if tokens.len() >= 8 {
        let without_zone = format!("{} {}", tokens[2..6].join(" "), tokens[tokens.len() - 1]);
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&without_zone, "%a %b %d %H:%M:%S %Y") {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }
    None
}

/// `From ` envelope line for a new flat-file message.
pub fn format_from_line(sender: &str, received: DateTime<Utc>) -> String {
    format!("From {sender} {}\n", received.format("%a %b %e %H:%M:%S %Y"))
}
