//! Monotonic millisecond clock for correlation and expiry timing.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Millisecond clock anchored to the wall epoch at construction but advanced
/// by the monotonic OS clock. Wall-clock adjustments (NTP steps, manual
/// changes) after startup cannot move it backwards or jump it forwards, so
/// correlation windows and token expiry checks stay consistent for the
/// lifetime of a capture session.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch_anchor_ms: u64,
    started: Instant,
}

impl MonotonicClock {
    /// Anchor a new clock to the current wall epoch.
    pub fn new() -> Self {
        let epoch_anchor_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            epoch_anchor_ms,
            started: Instant::now(),
        }
    }

    /// Anchor a clock at a fixed origin. Used by tests and replay sources.
    pub fn anchored_at(epoch_anchor_ms: u64) -> Self {
        Self {
            epoch_anchor_ms,
            started: Instant::now(),
        }
    }

    /// Current time in milliseconds on this clock's timeline.
    pub fn now_ms(&self) -> u64 {
        self.epoch_anchor_ms + self.started.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
