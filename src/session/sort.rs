//! View ordering. Sorting rearranges the visible view only; storage order
//! is what backends write back and is never touched here.

use std::cmp::Ordering;

use crate::model::record::MessageRecord;

use super::Mailbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    /// Storage order.
    #[default]
    Mailbox,
    Date,
    Received,
    Subject,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SortKey {
    pub field: SortField,
    pub reverse: bool,
}

impl SortKey {
    /// Parse `"date"`, `"reverse-subject"` and the like.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        let (reverse, name) = match s.strip_prefix("reverse-") {
            Some(rest) => (true, rest),
            None => (false, s.as_str()),
        };
        let field = match name {
            "mailbox" | "unsorted" => SortField::Mailbox,
            "date" | "date-sent" => SortField::Date,
            "received" | "date-received" => SortField::Received,
            "subject" => SortField::Subject,
            "size" => SortField::Size,
            _ => return None,
        };
        Some(Self { field, reverse })
    }

    fn compare(&self, a: &MessageRecord, b: &MessageRecord) -> Ordering {
        let ord = match self.field {
            SortField::Mailbox => Ordering::Equal,
            SortField::Date => a.date_sent.cmp(&b.date_sent),
            SortField::Received => a.received.cmp(&b.received),
            SortField::Subject => a
                .envelope
                .real_subject
                .as_deref()
                .unwrap_or_default()
                .to_lowercase()
                .cmp(&b.envelope.real_subject.as_deref().unwrap_or_default().to_lowercase()),
            SortField::Size => a.content.size().cmp(&b.content.size()),
        };
        let ord = ord.then(a.msgno.cmp(&b.msgno));
        if self.reverse {
            ord.reverse()
        } else {
            ord
        }
    }
}

impl Mailbox {
    /// Order the visible view by the session's sort key.
    pub fn sort(&mut self) {
        if self.sort_key.field == SortField::Subject && self.subj_hash.is_none() {
            self.subj_hash = Some(self.make_subj_hash());
        }
        self.rebuild_view();
    }

    /// Recompute `v2r` and virtual indices over the records currently in
    /// view, in sort order.
    pub(crate) fn rebuild_view(&mut self) {
        let key = self.sort_key;
        let mut visible: Vec<usize> = self
            .records
            .iter()
            .filter(|rec| rec.virtual_index.is_some())
            .map(|rec| rec.msgno)
            .collect();
        visible.sort_by(|&a, &b| key.compare(&self.records[a], &self.records[b]));

        self.v2r.clear();
        self.counters.vsize = 0;
        for msgno in visible {
            let rec = &mut self.records[msgno];
            rec.virtual_index = Some(self.v2r.len());
            self.counters.vsize += rec.content.size();
            self.v2r.push(msgno);
        }
    }
}
