//! rollcall-core — Attendance verification engine.
//!
//! Fuses two independent signals — a signed session token scanned from a QR
//! code and a camera liveness/presence signal — into a verification outcome
//! under a bounded correlation window. All logic here is pure: frames,
//! cameras, and stores live behind traits supplied by the caller.

pub mod clock;
pub mod presence;
pub mod token;
pub mod verify;

pub use clock::MonotonicClock;
pub use presence::{FaceScorer, PresenceDetector, PresencePolicy, PresenceSignal, StablePresence};
pub use token::{CodeScanner, ScanOutcome, SessionToken, SignatureVerifier, TokenDecoder};
pub use verify::{Effect, Outcome, VerificationResult, Verifier, VerifyEvent};
