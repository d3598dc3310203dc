//! Durable outbox: append-only SQLite journal with backoff replay.
//!
//! `enqueue` commits the record locally before returning, so a crash or
//! cancellation between attempts can never lose a Pending entry. The replay
//! pass delivers pending entries through the store trait; `Committed` is set
//! only on store acknowledgment, never assumed from local success.

use crate::recorder::AttendanceRecord;
use crate::store::{AttendanceStore, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS outbox (
    record_id        TEXT PRIMARY KEY,
    session_id       TEXT NOT NULL,
    subject_id       TEXT NOT NULL,
    session_epoch_ms INTEGER NOT NULL,
    verified_at_ms   INTEGER NOT NULL,
    recorded_at      TEXT NOT NULL,
    state            TEXT NOT NULL DEFAULT 'pending',
    attempts         INTEGER NOT NULL DEFAULT 0,
    last_attempt_ms  INTEGER,
    last_error       TEXT
);
CREATE INDEX IF NOT EXISTS idx_outbox_state ON outbox(state);
";

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("outbox lock poisoned")]
    LockPoisoned,
}

/// Delivery state of one journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Committed,
    Failed,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::Committed => "committed",
            EntryState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "committed" => EntryState::Committed,
            "failed" => EntryState::Failed,
            _ => EntryState::Pending,
        }
    }
}

/// One journal entry: the record plus its delivery bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxEntry {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    pub state: EntryState,
    pub attempts: u32,
    pub last_attempt_ms: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub committed: usize,
    pub failed: usize,
}

/// Retry policy for the replay pass.
#[derive(Debug, Clone, Copy)]
pub struct ReplayPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff_base_ms: 500,
            backoff_cap_ms: 60_000,
        }
    }
}

impl ReplayPolicy {
    /// Delay before attempt number `attempts + 1`: `base * 2^attempts`,
    /// capped. Pure so the due-time arithmetic is testable.
    pub fn backoff_delay_ms(&self, attempts: u32) -> u64 {
        let shift = attempts.min(16);
        self.backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_cap_ms)
    }
}

/// Counters from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub committed: usize,
    pub retried: usize,
    pub failed: usize,
}

/// SQLite-backed outbox journal. The connection is guarded by a mutex; the
/// enqueue path and the replay thread are the only writers.
pub struct Outbox {
    conn: Mutex<Connection>,
}

impl Outbox {
    /// Open (or create) the journal at the given path.
    pub fn open(path: &Path) -> Result<Self, OutboxError> {
        if let Some(dir) = path.parent() {
            // Creation failure surfaces as the open error below.
            let _ = std::fs::create_dir_all(dir);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "outbox journal opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory journal for tests.
    pub fn open_in_memory() -> Result<Self, OutboxError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, OutboxError> {
        self.conn.lock().map_err(|_| OutboxError::LockPoisoned)
    }

    /// Durably append a record. Returns false if an entry with the same
    /// record id already exists (idempotent local dedup).
    pub fn enqueue(&self, record: &AttendanceRecord) -> Result<bool, OutboxError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO outbox
               (record_id, session_id, subject_id, session_epoch_ms, verified_at_ms, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.record_id,
                record.session_id,
                record.subject_id,
                record.session_epoch_ms as i64,
                record.verified_at_ms as i64,
                record.recorded_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            tracing::debug!(record_id = %record.record_id, "duplicate enqueue ignored");
        }
        Ok(inserted > 0)
    }

    /// All entries in the given state (or all states), newest first.
    pub fn list(&self, state: Option<EntryState>, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let conn = self.lock()?;
        let (sql, state_filter) = match state {
            Some(s) => (
                "SELECT record_id, session_id, subject_id, session_epoch_ms, verified_at_ms,
                        recorded_at, state, attempts, last_attempt_ms, last_error
                 FROM outbox WHERE state = ?1 ORDER BY recorded_at DESC LIMIT ?2",
                Some(s.as_str()),
            ),
            None => (
                "SELECT record_id, session_id, subject_id, session_epoch_ms, verified_at_ms,
                        recorded_at, state, attempts, last_attempt_ms, last_error
                 FROM outbox WHERE ?1 IS NULL ORDER BY recorded_at DESC LIMIT ?2",
                None,
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![state_filter, limit as i64], row_to_entry)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Pending entries, oldest first, for the replay pass.
    pub fn pending(&self) -> Result<Vec<OutboxEntry>, OutboxError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT record_id, session_id, subject_id, session_epoch_ms, verified_at_ms,
                    recorded_at, state, attempts, last_attempt_ms, last_error
             FROM outbox WHERE state = 'pending' ORDER BY recorded_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_entry)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM outbox GROUP BY state")?;
        let mut stats = OutboxStats::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        for row in rows {
            let (state, count) = row?;
            match EntryState::parse(&state) {
                EntryState::Pending => stats.pending = count,
                EntryState::Committed => stats.committed = count,
                EntryState::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    /// Transition to Committed after store acknowledgment.
    pub fn mark_committed(&self, record_id: &str, now_ms: u64) -> Result<(), OutboxError> {
        self.lock()?.execute(
            "UPDATE outbox SET state = 'committed', last_attempt_ms = ?2, last_error = NULL
             WHERE record_id = ?1",
            params![record_id, now_ms as i64],
        )?;
        Ok(())
    }

    /// Record a failed attempt, keeping the entry Pending.
    pub fn record_attempt(&self, record_id: &str, error: &str, now_ms: u64) -> Result<(), OutboxError> {
        self.lock()?.execute(
            "UPDATE outbox SET attempts = attempts + 1, last_attempt_ms = ?2, last_error = ?3
             WHERE record_id = ?1",
            params![record_id, now_ms as i64, error],
        )?;
        Ok(())
    }

    /// Transition to Failed; surfaced for manual resolution, never retried.
    pub fn mark_failed(&self, record_id: &str, error: &str, now_ms: u64) -> Result<(), OutboxError> {
        self.lock()?.execute(
            "UPDATE outbox SET state = 'failed', attempts = attempts + 1,
                    last_attempt_ms = ?2, last_error = ?3
             WHERE record_id = ?1",
            params![record_id, now_ms as i64, error],
        )?;
        Ok(())
    }

    /// Reset a Failed entry to Pending (manual resolution path).
    pub fn retry_failed(&self, record_id: &str) -> Result<bool, OutboxError> {
        let updated = self.lock()?.execute(
            "UPDATE outbox SET state = 'pending', attempts = 0, last_error = NULL
             WHERE record_id = ?1 AND state = 'failed'",
            params![record_id],
        )?;
        Ok(updated > 0)
    }

    /// Delete Committed entries whose last attempt is older than the
    /// retention window. Pending and Failed entries are never collected.
    pub fn gc_committed(&self, retention_ms: u64, now_ms: u64) -> Result<usize, OutboxError> {
        let cutoff = now_ms.saturating_sub(retention_ms);
        let deleted = self.lock()?.execute(
            "DELETE FROM outbox WHERE state = 'committed' AND last_attempt_ms < ?1",
            params![cutoff as i64],
        )?;
        if deleted > 0 {
            tracing::debug!(deleted, "outbox gc");
        }
        Ok(deleted)
    }

    pub fn get(&self, record_id: &str) -> Result<Option<OutboxEntry>, OutboxError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT record_id, session_id, subject_id, session_epoch_ms, verified_at_ms,
                    recorded_at, state, attempts, last_attempt_ms, last_error
             FROM outbox WHERE record_id = ?1",
            params![record_id],
            row_to_entry,
        )
        .optional()
        .map_err(Into::into)
    }

    /// One delivery pass over due pending entries.
    pub fn replay_pending(
        &self,
        store: &dyn AttendanceStore,
        policy: &ReplayPolicy,
        now_ms: u64,
    ) -> Result<ReplayOutcome, OutboxError> {
        let mut outcome = ReplayOutcome::default();

        for entry in self.pending()? {
            let due = match entry.last_attempt_ms {
                None => true,
                Some(last) => now_ms >= last + policy.backoff_delay_ms(entry.attempts),
            };
            if !due {
                continue;
            }

            match store.upsert(&entry.record) {
                Ok(()) => {
                    self.mark_committed(&entry.record.record_id, now_ms)?;
                    tracing::info!(record_id = %entry.record.record_id, "outbox entry committed");
                    outcome.committed += 1;
                }
                Err(StoreError::Transient(err)) => {
                    if entry.attempts + 1 >= policy.max_attempts {
                        self.mark_failed(&entry.record.record_id, &err, now_ms)?;
                        tracing::warn!(
                            record_id = %entry.record.record_id,
                            attempts = entry.attempts + 1,
                            error = %err,
                            "outbox entry failed after exhausting retries"
                        );
                        outcome.failed += 1;
                    } else {
                        self.record_attempt(&entry.record.record_id, &err, now_ms)?;
                        tracing::debug!(
                            record_id = %entry.record.record_id,
                            attempts = entry.attempts + 1,
                            error = %err,
                            "transient store error, will retry"
                        );
                        outcome.retried += 1;
                    }
                }
                Err(StoreError::Permanent(err)) => {
                    self.mark_failed(&entry.record.record_id, &err, now_ms)?;
                    tracing::error!(
                        record_id = %entry.record.record_id,
                        error = %err,
                        "permanent store error, entry failed"
                    );
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let recorded_at_raw: String = row.get(5)?;
    let recorded_at = DateTime::parse_from_rfc3339(&recorded_at_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let state_raw: String = row.get(6)?;
    Ok(OutboxEntry {
        record: AttendanceRecord {
            record_id: row.get(0)?,
            session_id: row.get(1)?,
            subject_id: row.get(2)?,
            session_epoch_ms: row.get::<_, i64>(3)? as u64,
            verified_at_ms: row.get::<_, i64>(4)? as u64,
            recorded_at,
        },
        state: EntryState::parse(&state_raw),
        attempts: row.get::<_, i64>(7)? as u32,
        last_attempt_ms: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
        last_error: row.get(9)?,
    })
}

/// Replay loop on a dedicated thread. Shutdown between attempts only pauses
/// retries; Pending entries stay in the journal untouched. Each cycle adds a
/// small random jitter so a fleet of devices does not hammer the store in
/// lockstep after an outage.
pub fn run_replay(
    outbox: Arc<Outbox>,
    store: Arc<dyn AttendanceStore>,
    policy: ReplayPolicy,
    poll_interval_ms: u64,
    retention_ms: u64,
    shutdown: Arc<AtomicBool>,
) {
    use rand::Rng;

    tracing::info!("outbox replay loop started");
    while !shutdown.load(Ordering::Relaxed) {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;

        if let Err(e) = outbox.replay_pending(store.as_ref(), &policy, now_ms) {
            tracing::error!(error = %e, "replay pass failed");
        }
        if let Err(e) = outbox.gc_committed(retention_ms, now_ms) {
            tracing::error!(error = %e, "outbox gc failed");
        }

        let jitter = rand::thread_rng().gen_range(0..=poll_interval_ms / 4);
        let mut remaining = poll_interval_ms + jitter;
        // Sleep in slices so shutdown is honored promptly.
        while remaining > 0 && !shutdown.load(Ordering::Relaxed) {
            let slice = remaining.min(100);
            std::thread::sleep(std::time::Duration::from_millis(slice));
            remaining -= slice;
        }
    }
    tracing::info!("outbox replay loop stopped");
}
