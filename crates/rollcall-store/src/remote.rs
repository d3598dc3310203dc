//! HTTP attendance store adapter.
//!
//! Talks to a remote attendance service over a small REST surface:
//! `PUT {base}/records/{record_id}` with the record as JSON. The server is
//! expected to treat the PUT as an upsert keyed by the record id, which keeps
//! the wire contract aligned with [`AttendanceStore`].

use crate::recorder::AttendanceRecord;
use crate::store::{AttendanceStore, StoreError};
use std::time::Duration;

pub struct HttpStore {
    client: reqwest::blocking::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStore {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, StoreError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StoreError::Permanent(format!("http client init: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn record_url(&self, record_id: &str) -> String {
        format!("{}/records/{}", self.base_url, record_id)
    }

    /// Cheap liveness probe against the service health endpoint.
    pub fn check(&self) -> Result<(), StoreError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .map_err(|e| StoreError::Transient(format!("health check: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(classify_status(response.status(), "health check failed"))
        }
    }
}

/// Retryable statuses: server-side trouble or throttling. Everything else
/// non-successful is a contract problem that retrying cannot fix.
fn classify_status(status: reqwest::StatusCode, body: &str) -> StoreError {
    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        StoreError::Transient(format!("{}: {body}", status.as_u16()))
    } else {
        StoreError::Permanent(format!("{}: {body}", status.as_u16()))
    }
}

impl AttendanceStore for HttpStore {
    fn upsert(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let mut request = self
            .client
            .put(self.record_url(&record.record_id))
            .header("Content-Type", "application/json")
            .json(record);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .map_err(|e| StoreError::Transient(format!("network: {e}")))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(record_id = %record.record_id, status = status.as_u16(), "record upserted");
            return Ok(());
        }

        let body = response
            .text()
            .unwrap_or_else(|_| "unreadable response body".to_string());
        Err(classify_status(status, &body))
    }
}
