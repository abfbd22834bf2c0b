//! File-backed table storage.
//!
//! The queue and the execution log are plain CSV files on shared storage,
//! read and written under advisory `flock` locks so that submitters and the
//! driver on different hosts never interleave writes.

pub mod table;

pub use table::{LockMode, LockedTable, RawTable};
