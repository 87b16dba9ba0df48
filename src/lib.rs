//! `mxShell`: mailbox sessions over mbox, MMDF, MH and maildir stores.
//!
//! This crate detects the format of a mailbox, locks it the way mail
//! clients do, indexes its messages into a [`session::Mailbox`] and runs
//! the sync and close pipelines through the [`mx::Mx`] runtime. Each
//! storage format is a [`backend::Backend`] registered by kind.

pub mod backend;
pub mod config;
pub mod detect;
pub mod error;
pub mod i18n;
pub mod lock;
pub mod model;
pub mod mx;
pub mod parser;
pub mod prompt;
pub mod session;
pub mod stamp;

pub use error::{MxError, Result};
pub use mx::{CloseOutcome, CloseSummary, Mx, SyncOutcome};
pub use session::{Flag, Mailbox, OpenFlags};
