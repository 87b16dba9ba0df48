//! Index reconciliation: the compaction pass run after a check for new
//! mail, a sync or an expunge.

use std::mem;

use tracing::debug;

use crate::model::kind::MailboxKind;
use crate::model::record::MessageRecord;

use super::{Counters, Mailbox};

impl Mailbox {
    /// Drop the records that no longer belong to the mailbox and renumber
    /// the rest.
    ///
    /// With `committing` a record survives unless it is deleted (trashed
    /// maildir messages stay); without it a record survives while the
    /// backend still reports it `active`. Quasi-deleted records never
    /// survive. Counters are recounted from the survivors.
    pub fn update_tables(&mut self, committing: bool) {
        let trash_in_place = self.kind == MailboxKind::Maildir && self.maildir_trash;
        let per_message_file = self.kind.is_per_message_file();

        let old = mem::take(&mut self.records);
        let before = old.len();
        self.records.reserve(old.capacity());
        self.v2r.clear();
        self.slots.clear();
        self.counters = Counters {
            size: self.counters.size,
            ..Counters::default()
        };

        for mut rec in old {
            let f = rec.flags;
            let survives = !f.quasi_deleted
                && ((committing && (!f.deleted || trash_in_place)) || (!committing && f.active));

            if !survives {
                if per_message_file {
                    self.counters.size = self.counters.size.saturating_sub(rec.content.size());
                }
                self.forget(&rec);
                continue;
            }

            let msgno = self.records.len();
            rec.msgno = msgno;
            if rec.virtual_index.is_some() {
                rec.virtual_index = Some(self.v2r.len());
                self.v2r.push(msgno);
                self.counters.vsize += rec.content.size();
            }

            if committing {
                rec.flags.changed = false;
            } else if rec.flags.changed {
                self.counters.changed = true;
            }
            if (!committing || trash_in_place) && rec.flags.deleted {
                self.counters.deleted += 1;
            }
            if rec.flags.tagged {
                self.counters.tagged += 1;
            }
            if rec.flags.flagged {
                self.counters.flagged += 1;
            }
            if !rec.flags.read {
                self.counters.unread += 1;
                if !rec.flags.old {
                    self.counters.new += 1;
                }
            }

            self.slots.insert(rec.id, msgno);
            self.records.push(rec);
        }

        debug!(
            path = %self.path.display(),
            committing,
            before,
            after = self.records.len(),
            "Reconciled index"
        );
    }

    /// Remove every look-aside reference to a record being released.
    fn forget(&mut self, rec: &MessageRecord) {
        if let (Some(index), Some(mid)) = (self.id_hash.as_mut(), rec.envelope.message_id.as_deref()) {
            index.remove(mid, rec.id);
        }
        if let (Some(index), Some(subject)) =
            (self.subj_hash.as_mut(), rec.envelope.real_subject.as_deref())
        {
            index.remove(subject, rec.id);
        }
        self.labels.remove(&rec.envelope.labels);
        if self.last_tag == Some(rec.id) {
            self.last_tag = None;
        }
    }
}
