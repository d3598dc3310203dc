use crate::engine::EngineHandle;
use rollcall_store::{EntryState, Outbox};
use std::sync::Arc;
use zbus::interface;

/// D-Bus control surface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// All structured replies are JSON strings; the UI layer owns presentation.
pub struct AttendanceService {
    engine: EngineHandle,
    outbox: Arc<Outbox>,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, outbox: Arc<Outbox>) -> Self {
        Self { engine, outbox }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Submit raw scan text decoded by the UI layer's scanner. Returns true
    /// when the text decoded to a signature-valid session token.
    async fn submit_scan(&self, text: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(len = text.len(), "scan submitted over bus");
        self.engine
            .submit_scan(text.to_string())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Daemon status: engine counters, pending correlation, outbox totals.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let engine = self
            .engine
            .status()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let outbox = self
            .outbox
            .stats()
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "frames_processed": engine.frames_processed,
            "frames_rejected": engine.frames_rejected,
            "scans_submitted": engine.scans_submitted,
            "correlation_pending": engine.correlation_pending,
            "outbox": outbox,
        })
        .to_string())
    }

    /// Most recent verification results, oldest first.
    async fn recent_results(&self) -> zbus::fdo::Result<String> {
        let status = self
            .engine
            .status()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&status.recent_results)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// List outbox entries. `state` is "pending", "committed", "failed" or
    /// "" for all.
    async fn outbox_list(&self, state: &str, limit: u32) -> zbus::fdo::Result<String> {
        let filter = match state {
            "" | "all" => None,
            "pending" => Some(EntryState::Pending),
            "committed" => Some(EntryState::Committed),
            "failed" => Some(EntryState::Failed),
            other => {
                return Err(zbus::fdo::Error::InvalidArgs(format!(
                    "unknown state filter: {other}"
                )))
            }
        };
        let entries = self
            .outbox
            .list(filter, limit as usize)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&entries).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Reset a Failed outbox entry to Pending so the replay loop picks it up
    /// again. Returns false if the entry is missing or not Failed.
    async fn outbox_retry(&self, record_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(record_id, "manual outbox retry requested");
        self.outbox
            .retry_failed(record_id)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}
