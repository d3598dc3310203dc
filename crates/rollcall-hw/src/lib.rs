//! rollcall-hw — Hardware abstraction for camera frame capture.
//!
//! Provides the immutable [`Frame`] snapshot the verification pipeline
//! consumes, frame quality metrics (exposure and sharpness), and
//! [`FrameSource`] implementations: a V4L2 camera and a scripted replay
//! source for tests and offline runs.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{CameraError, CameraSource, DeviceInfo};
pub use frame::{Frame, QualityPolicy};
pub use source::{FrameSource, ReplaySource, SourceError};
