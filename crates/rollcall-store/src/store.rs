//! Store boundary: upsert semantics with a transient/permanent error split.

use crate::recorder::AttendanceRecord;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Worth retrying with backoff (network blip, 5xx, timeout).
    #[error("transient store error: {0}")]
    Transient(String),
    /// Never retried; surfaced for manual resolution (schema rejection, auth).
    #[error("permanent store error: {0}")]
    Permanent(String),
}

/// The remote attendance store, opaque to the core. `upsert` MUST be keyed
/// by `record_id`: writing the same record twice is acknowledged, not an
/// error.
pub trait AttendanceStore: Send + Sync {
    fn upsert(&self, record: &AttendanceRecord) -> Result<(), StoreError>;
}

/// In-memory store for tests and offline bring-up.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, AttendanceRecord>>,
    upserts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct records held.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total upsert calls, including idempotent re-writes.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::Relaxed)
    }

    pub fn get(&self, record_id: &str) -> Option<AttendanceRecord> {
        self.records.lock().ok()?.get(record_id).cloned()
    }
}

impl AttendanceStore for MemoryStore {
    fn upsert(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        self.upserts.fetch_add(1, Ordering::Relaxed);
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::Permanent("store lock poisoned".into()))?;
        records.insert(record.record_id.clone(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str) -> AttendanceRecord {
        AttendanceRecord {
            record_id: id.into(),
            session_id: "S1".into(),
            subject_id: "stu-1".into(),
            session_epoch_ms: 0,
            verified_at_ms: 3_000,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_memory_store_upsert_is_idempotent() {
        let store = MemoryStore::new();
        store.upsert(&record("r1")).unwrap();
        store.upsert(&record("r1")).unwrap();
        assert_eq!(store.len(), 1, "one logical entity");
        assert_eq!(store.upsert_count(), 2);
    }

    #[test]
    fn test_memory_store_distinct_ids() {
        let store = MemoryStore::new();
        store.upsert(&record("r1")).unwrap();
        store.upsert(&record("r2")).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get("r1").is_some());
    }
}
