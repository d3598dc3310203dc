//! Attendance recorder — turns `Verified` results into idempotent records.
//!
//! The record id is a deterministic hash of `(session, subject, epoch)`, so a
//! second verification of the same pair produces the same id and the store's
//! upsert makes re-submission a no-op rather than an error.

use chrono::{DateTime, Utc};
use rollcall_core::{Outcome, VerificationResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A durable attendance fact. Exactly one exists per
/// `(session_id, subject_id, session_epoch)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    /// Deterministic hash key; the store upserts on this.
    pub record_id: String,
    pub session_id: String,
    pub subject_id: String,
    pub session_epoch_ms: u64,
    pub verified_at_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordRejected {
    #[error("outcome {0} is not recordable")]
    NotVerified(Outcome),
}

/// SHA-256 over the dedup key fields, with a separator byte so field
/// boundaries cannot be forged by concatenation.
pub fn record_id(session_id: &str, subject_id: &str, session_epoch_ms: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(subject_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(session_epoch_ms.to_be_bytes());
    rollcall_core::token::to_hex(&hasher.finalize())
}

pub struct Recorder;

impl Recorder {
    /// Convert a verification result into a record. Only `Verified` outcomes
    /// are recordable; everything else is rejected with the outcome as the
    /// reason.
    pub fn record(result: &VerificationResult) -> Result<AttendanceRecord, RecordRejected> {
        if result.outcome != Outcome::Verified {
            return Err(RecordRejected::NotVerified(result.outcome));
        }
        let record = AttendanceRecord {
            record_id: record_id(
                &result.session_id,
                &result.subject_id,
                result.session_epoch_ms,
            ),
            session_id: result.session_id.clone(),
            subject_id: result.subject_id.clone(),
            session_epoch_ms: result.session_epoch_ms,
            verified_at_ms: result.verified_at_ms,
            recorded_at: Utc::now(),
        };
        tracing::info!(
            record_id = %record.record_id,
            session = %record.session_id,
            subject = %record.subject_id,
            "attendance recorded"
        );
        Ok(record)
    }
}
