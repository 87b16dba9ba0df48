//! Core data model types: mailbox kinds and message records.

pub mod kind;
pub mod record;

pub use kind::MailboxKind;
pub use record::{ContentLocation, EnvelopeRef, MessageFlags, MessageRecord, RecordId};
