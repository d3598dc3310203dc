//! Presence detection: per-frame liveness signals and K-of-N debouncing.
//!
//! A single frame crossing the confidence threshold is never enough — a
//! printed photo glimpsed for one frame must not combine with a token into a
//! verification. Stability requires K qualifying signals out of the last N,
//! tracked in a bounded ring. Frames flagged as low quality (underexposed or
//! motion-blurred) never qualify regardless of confidence.

use std::collections::VecDeque;

/// One per-frame liveness observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceSignal {
    /// Liveness confidence in [0, 1], monotonic in the model's output.
    pub confidence: f32,
    pub captured_at_ms: u64,
    /// False for underexposed or motion-blurred frames.
    pub frame_quality_ok: bool,
}

/// Emitted once K-of-N qualifying signals have accumulated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StablePresence {
    /// Highest confidence among the qualifying signals in the window.
    pub confidence: f32,
    /// Timestamp of the signal that completed the quorum.
    pub stable_at_ms: u64,
}

/// Capability that scores a luma frame for a live face. The actual model
/// (on-device CNN, vendor SDK) is the wider system's concern.
pub trait FaceScorer: Send {
    /// Liveness confidence in [0, 1] for the given grayscale frame.
    fn score(&mut self, luma: &[u8], width: u32, height: u32) -> f32;
}

/// Debounce policy: K-of-N with a confidence floor.
#[derive(Debug, Clone, Copy)]
pub struct PresencePolicy {
    pub confidence_threshold: f32,
    /// K — qualifying signals required for stability.
    pub stable_required: usize,
    /// N — ring capacity the quorum is counted over.
    pub window: usize,
}

impl Default for PresencePolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.85,
            stable_required: 3,
            window: 5,
        }
    }
}

/// Rolling K-of-N debouncer over per-frame signals.
pub struct PresenceDetector {
    policy: PresencePolicy,
    ring: VecDeque<PresenceSignal>,
}

impl PresenceDetector {
    pub fn new(policy: PresencePolicy) -> Self {
        let window = policy.window.max(1);
        // K > N can never reach quorum; clamp rather than silently wedge.
        let stable_required = policy.stable_required.clamp(1, window);
        if stable_required != policy.stable_required {
            tracing::warn!(
                requested = policy.stable_required,
                window,
                clamped = stable_required,
                "stable_required outside [1, window]; clamped"
            );
        }
        Self {
            policy: PresencePolicy {
                window,
                stable_required,
                ..policy
            },
            ring: VecDeque::with_capacity(window),
        }
    }

    fn qualifies(&self, signal: &PresenceSignal) -> bool {
        signal.frame_quality_ok && signal.confidence >= self.policy.confidence_threshold
    }

    /// Feed one signal. Returns a stable presence event when the quorum is
    /// reached; the ring then resets so the next stability requires a fresh
    /// quorum rather than re-firing on every subsequent frame.
    pub fn push(&mut self, signal: PresenceSignal) -> Option<StablePresence> {
        if self.ring.len() == self.policy.window {
            self.ring.pop_front();
        }
        self.ring.push_back(signal);

        let qualifying = self.ring.iter().filter(|s| self.qualifies(s)).count();
        if qualifying < self.policy.stable_required {
            return None;
        }

        let confidence = self
            .ring
            .iter()
            .filter(|s| self.qualifies(s))
            .map(|s| s.confidence)
            .fold(0.0f32, f32::max);

        tracing::debug!(
            qualifying,
            window = self.policy.window,
            confidence,
            "presence stable"
        );
        self.ring.clear();
        Some(StablePresence {
            confidence,
            stable_at_ms: signal.captured_at_ms,
        })
    }

    /// Drop accumulated signals, e.g. when the capture session restarts.
    pub fn reset(&mut self) {
        self.ring.clear();
    }
}
