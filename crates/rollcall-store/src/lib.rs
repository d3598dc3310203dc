//! rollcall-store — Durable attendance persistence.
//!
//! Converts `Verified` results into idempotent [`AttendanceRecord`]s, buffers
//! them in a SQLite-backed outbox that survives process restarts, and replays
//! them to the remote store with bounded exponential backoff. The store
//! itself is opaque behind [`AttendanceStore`]; the only contract it must
//! honor is upsert-by-record-id with a transient/permanent error split.

pub mod outbox;
pub mod recorder;
pub mod remote;
pub mod store;

pub use outbox::{
    run_replay, EntryState, Outbox, OutboxEntry, OutboxError, OutboxStats, ReplayOutcome,
    ReplayPolicy,
};
pub use recorder::{record_id, AttendanceRecord, RecordRejected, Recorder};
pub use remote::HttpStore;
pub use store::{AttendanceStore, MemoryStore, StoreError};
