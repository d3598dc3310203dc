//! Frame source abstraction.
//!
//! The pipeline pulls frames through this trait; it never knows whether they
//! come from a V4L2 camera or a scripted replay.

use crate::frame::Frame;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    /// The source has no more frames (replay drained, camera unplugged).
    #[error("frame source exhausted")]
    Exhausted,
    #[error("capture failed: {0}")]
    Capture(String),
}

/// Pull-based supplier of immutable frame snapshots.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, SourceError>;
}

/// Scripted source replaying pre-built frames in order. Used by tests and
/// offline runs; an empty replay acts as a null source.
pub struct ReplaySource {
    frames: VecDeque<Frame>,
}

impl ReplaySource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            frames: VecDeque::new(),
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push_back(frame);
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        self.frames.pop_front().ok_or(SourceError::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u32) -> Frame {
        Frame {
            luma: vec![128; 4],
            width: 2,
            height: 2,
            captured_at: std::time::Instant::now(),
            sequence: seq,
            quality_ok: true,
        }
    }

    #[test]
    fn test_replay_in_order_then_exhausted() {
        let mut source = ReplaySource::new([frame(0), frame(1)]);
        assert_eq!(source.next_frame().unwrap().sequence, 0);
        assert_eq!(source.next_frame().unwrap().sequence, 1);
        assert!(matches!(source.next_frame(), Err(SourceError::Exhausted)));
    }

    #[test]
    fn test_empty_replay_is_null_source() {
        let mut source = ReplaySource::empty();
        assert!(matches!(source.next_frame(), Err(SourceError::Exhausted)));
    }
}
