//! Everything touching corpus files on disk: seeds before the trial, engine output during it.

pub mod archive;
pub mod layout;
pub mod seed;

/// Seeds above this size are dropped.
pub const CORPUS_ELEMENT_BYTES_LIMIT: u64 = 1024 * 1024;
