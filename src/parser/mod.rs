//! Minimal message reading for the bundled backends: the header fields the
//! session indexes, and the flat-file separator scanner.

pub mod header;
pub mod mbox;
