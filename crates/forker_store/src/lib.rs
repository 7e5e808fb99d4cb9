//! Durable state store for the Forker replication engine.
//!
//! A single-file SQLite database journaled with WAL. Every state
//! transition of a job or target commits in one transaction together with
//! its audit-log row, so a crash at any point leaves the last committed
//! state intact and recovery can trust what it reads.
//!
//! Writes are serialized behind one async mutex (transitions are small and
//! bursty; the heavy copy I/O happens far away from the store). Reads run
//! concurrently against the pool.

mod dead_letter;
mod error;
mod models;
mod quarantine;
mod schema;
mod state_log;
mod store;

pub use dead_letter::NewDeadLetter;
pub use state_log::NewStateChange;
pub use error::{Result, StoreError};
pub use models::{
    DeadLetterEntry, FileJob, JobWithTargets, NewJob, QuarantineEntry, StateChangeLogEntry,
    TargetOutcome, TargetPatch, TargetSnapshot,
};
pub use store::Store;
