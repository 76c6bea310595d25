#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **afftok-wal** – Segmented write-ahead log for the Afftok core.
//!
//! Every event admitted by the ingest front is appended here, fsynced, and
//! only then handed to downstream processors. Segments are JSONL files named
//! `wal_<UTC yyyymmdd_hhmmss>.log`; each line carries its own checksum and a
//! line that fails parsing or verification is skipped and counted, never
//! executed. Status updates are appended as superseding records, so the log
//! stays append-only while entry state remains recoverable after a crash.
//!
//! Guarantees:
//!
//! - once `append` returns, the entry survives a crash;
//! - sequence numbers are strictly increasing within a process and recover
//!   to the on-disk maximum on restart;
//! - status transitions are monotone (`pending` → terminal, never back);
//! - `replay` re-delivers exactly the entries that never went terminal, in
//!   sequence order;
//! - `compact` deletes only segments whose every referenced entry is
//!   terminal.

mod error;
mod log;
mod segment;

pub use error::{WalError, WalResult};
pub use log::{
    CompactionSummary, ReplayHandler, ReplaySummary, WalConfig, WalMetrics, WriteAheadLog,
};
