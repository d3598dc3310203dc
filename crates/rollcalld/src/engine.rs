//! Capture engine: the single-writer actor that owns the verification
//! pipeline for one capture session.
//!
//! The engine runs on a dedicated OS thread. Each loop iteration it drains
//! control commands, pulls one frame, scores it for presence, optionally
//! scans it for a session code, and feeds the resulting events through the
//! state machine. `Verified` outcomes flow into the recorder and the durable
//! outbox; every terminal outcome is broadcast to subscribers.
//!
//! All pipeline mutation happens in [`Engine`] methods on the engine thread;
//! the async side only ever talks to it through the command channel.

use rollcall_core::{
    CodeScanner, FaceScorer, MonotonicClock, PresenceDetector, PresencePolicy, PresenceSignal,
    ScanOutcome, TokenDecoder, VerificationResult,
};
use rollcall_core::verify::{Effect, Verifier, VerifyEvent};
use rollcall_hw::{Frame, FrameSource, SourceError};
use rollcall_store::{Outbox, Recorder};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

const RECENT_RESULTS: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of engine health for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub frames_processed: u64,
    pub frames_rejected: u64,
    pub scans_submitted: u64,
    pub correlation_pending: bool,
    pub recent_results: Vec<VerificationResult>,
}

/// Messages sent from the async side to the engine thread.
enum EngineCommand {
    SubmitScan {
        text: String,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    results: broadcast::Sender<VerificationResult>,
}

impl EngineHandle {
    /// Submit raw scan text on behalf of the UI layer. Returns true when the
    /// text decoded to a signature-valid token.
    pub async fn submit_scan(&self, text: String) -> Result<bool, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::SubmitScan {
                text,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Subscribe to the stream of verification results.
    pub fn subscribe(&self) -> broadcast::Receiver<VerificationResult> {
        self.results.subscribe()
    }
}

/// Tuning for one capture session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub subject_id: String,
    pub correlation_window_ms: u64,
    pub scan_interval_ms: u64,
    pub presence: PresencePolicy,
}

/// The verification pipeline. Owned by the engine thread; tests drive it
/// directly without any threading.
pub struct Engine {
    decoder: TokenDecoder,
    scorer: Box<dyn FaceScorer>,
    scanner: Option<Box<dyn CodeScanner>>,
    detector: PresenceDetector,
    verifier: Verifier,
    outbox: Arc<Outbox>,
    results_tx: broadcast::Sender<VerificationResult>,
    recent: VecDeque<VerificationResult>,
    scan_interval_ms: u64,
    last_scan_ms: Option<u64>,
    frames_processed: u64,
    frames_rejected: u64,
    scans_submitted: u64,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        decoder: TokenDecoder,
        scorer: Box<dyn FaceScorer>,
        scanner: Option<Box<dyn CodeScanner>>,
        outbox: Arc<Outbox>,
    ) -> Self {
        let (results_tx, _) = broadcast::channel(RECENT_RESULTS);
        Self {
            decoder,
            scorer,
            scanner,
            detector: PresenceDetector::new(config.presence),
            verifier: Verifier::new(config.subject_id, config.correlation_window_ms),
            outbox,
            results_tx,
            recent: VecDeque::with_capacity(RECENT_RESULTS),
            scan_interval_ms: config.scan_interval_ms,
            last_scan_ms: None,
            frames_processed: 0,
            frames_rejected: 0,
            scans_submitted: 0,
        }
    }

    /// Run one frame through the pipeline: scan (throttled), score, debounce,
    /// step the state machine.
    pub fn process_frame(&mut self, frame: &Frame, now_ms: u64) {
        self.frames_processed += 1;
        if !frame.quality_ok {
            self.frames_rejected += 1;
        }

        if self.scan_due(now_ms) {
            if let Some(scanner) = self.scanner.as_mut() {
                self.last_scan_ms = Some(now_ms);
                if let Some(text) = scanner.scan(&frame.luma, frame.width, frame.height) {
                    let outcome = self.decoder.decode(&text);
                    let effects = self.verifier.step(VerifyEvent::Scan {
                        outcome,
                        at_ms: now_ms,
                    });
                    self.apply(effects);
                }
            }
        }

        let confidence = self.scorer.score(&frame.luma, frame.width, frame.height);
        let signal = PresenceSignal {
            confidence,
            captured_at_ms: now_ms,
            frame_quality_ok: frame.quality_ok,
        };

        let effects = match self.detector.push(signal) {
            Some(stable) => self.verifier.step(VerifyEvent::Presence(stable)),
            None => self.verifier.step(VerifyEvent::Tick { now_ms }),
        };
        self.apply(effects);
    }

    /// Handle scan text arriving from the control surface rather than the
    /// frame path. Returns true when it decoded to a signature-valid token.
    pub fn submit_scan(&mut self, text: &str, now_ms: u64) -> bool {
        self.scans_submitted += 1;
        let outcome = self.decoder.decode(text);
        let accepted = matches!(outcome, ScanOutcome::Token(_));
        let effects = self.verifier.step(VerifyEvent::Scan {
            outcome,
            at_ms: now_ms,
        });
        self.apply(effects);
        accepted
    }

    /// Advance timers when no frame arrived (camera stalled or absent).
    pub fn tick(&mut self, now_ms: u64) {
        let effects = self.verifier.step(VerifyEvent::Tick { now_ms });
        self.apply(effects);
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            frames_processed: self.frames_processed,
            frames_rejected: self.frames_rejected,
            scans_submitted: self.scans_submitted,
            correlation_pending: !self.verifier.is_idle(),
            recent_results: self.recent.iter().cloned().collect(),
        }
    }

    fn scan_due(&self, now_ms: u64) -> bool {
        match self.last_scan_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.scan_interval_ms,
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Report(result) => self.report(result),
                Effect::TokenSuperseded { session_id } => {
                    tracing::info!(session = %session_id, "pending token superseded by newer scan");
                }
                Effect::PresenceDiscarded { stable_at_ms } => {
                    tracing::debug!(stable_at_ms, "stable presence discarded");
                }
                Effect::MalformedScan { reason } => {
                    tracing::warn!(reason, "malformed scan payload");
                }
            }
        }
    }

    /// Route a terminal outcome: record + enqueue if verified, then broadcast.
    fn report(&mut self, result: VerificationResult) {
        match Recorder::record(&result) {
            Ok(record) => match self.outbox.enqueue(&record) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(record_id = %record.record_id, "already recorded for this session epoch");
                }
                Err(e) => {
                    // The outcome is still broadcast; the record is lost only
                    // if the journal itself is broken.
                    tracing::error!(error = %e, "failed to enqueue attendance record");
                }
            },
            Err(rejected) => {
                tracing::debug!(reason = %rejected, "outcome not recordable");
            }
        }

        if self.recent.len() == RECENT_RESULTS {
            self.recent.pop_front();
        }
        self.recent.push_back(result.clone());
        // Err means no subscribers, which is fine.
        let _ = self.results_tx.send(result);
    }
}

/// Stand-in scorer for deployments without a liveness model wired in. Scores
/// every frame at zero, so presence never stabilizes and every token times
/// out as NoPresence rather than silently passing.
pub struct NullScorer;

impl FaceScorer for NullScorer {
    fn score(&mut self, _luma: &[u8], _width: u32, _height: u32) -> f32 {
        0.0
    }
}

/// Spawn the engine on a dedicated OS thread.
pub fn spawn_engine(
    mut engine: Engine,
    mut source: Box<dyn FrameSource>,
    clock: MonotonicClock,
    shutdown: Arc<AtomicBool>,
) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineCommand>(8);
    let results = engine.results_tx.clone();

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut source_down = false;

            while !shutdown.load(Ordering::Relaxed) {
                // Drain control commands first so a D-Bus scan is never
                // delayed behind frame processing.
                loop {
                    match rx.try_recv() {
                        Ok(EngineCommand::SubmitScan { text, reply }) => {
                            let accepted = engine.submit_scan(&text, clock.now_ms());
                            let _ = reply.send(accepted);
                        }
                        Ok(EngineCommand::Status { reply }) => {
                            let _ = reply.send(engine.status());
                        }
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            tracing::info!("engine thread exiting (handle dropped)");
                            return;
                        }
                    }
                }

                match source.next_frame() {
                    Ok(frame) => {
                        source_down = false;
                        engine.process_frame(&frame, clock.now_ms());
                    }
                    Err(SourceError::Exhausted) => {
                        // No frames to pull; keep timers alive and idle until
                        // the next command.
                        if !source_down {
                            tracing::info!("frame source exhausted; scan submission only");
                            source_down = true;
                        }
                        engine.tick(clock.now_ms());
                        std::thread::sleep(std::time::Duration::from_millis(50));
                    }
                    Err(SourceError::Capture(e)) => {
                        tracing::warn!(error = %e, "frame capture failed; skipping");
                        engine.tick(clock.now_ms());
                        std::thread::sleep(std::time::Duration::from_millis(50));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx, results }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::token::HmacVerifier;
    use rollcall_core::Outcome;
    use rollcall_store::{MemoryStore, ReplayPolicy};
    use std::time::Instant;

    const KEY: &[u8] = b"engine-test-key";

    fn signed_token_text(session: &str, issued: u64, expires: u64) -> String {
        let verifier = HmacVerifier::new(KEY);
        let sig = verifier.sign(&format!("{session}|{issued}|{expires}"));
        format!("{session}|{issued}|{expires}|{sig}")
    }

    fn frame(seq: u32, quality_ok: bool) -> Frame {
        Frame {
            luma: vec![128; 16],
            width: 4,
            height: 4,
            captured_at: Instant::now(),
            sequence: seq,
            quality_ok,
        }
    }

    /// Scorer returning a scripted confidence per call.
    struct ScriptedScorer(Vec<f32>);

    impl FaceScorer for ScriptedScorer {
        fn score(&mut self, _luma: &[u8], _width: u32, _height: u32) -> f32 {
            if self.0.is_empty() {
                0.0
            } else {
                self.0.remove(0)
            }
        }
    }

    /// Scanner that yields scan text once, on a chosen call index.
    struct OneShotScanner {
        text: Option<String>,
        fire_on_call: usize,
        calls: usize,
    }

    impl CodeScanner for OneShotScanner {
        fn scan(&mut self, _luma: &[u8], _width: u32, _height: u32) -> Option<String> {
            self.calls += 1;
            if self.calls == self.fire_on_call {
                self.text.take()
            } else {
                None
            }
        }
    }

    fn engine_with(
        scorer: Box<dyn FaceScorer>,
        scanner: Option<Box<dyn CodeScanner>>,
        outbox: Arc<Outbox>,
    ) -> Engine {
        let config = EngineConfig {
            subject_id: "stu-1".into(),
            correlation_window_ms: 5_000,
            scan_interval_ms: 0,
            presence: PresencePolicy {
                confidence_threshold: 0.85,
                stable_required: 3,
                window: 5,
            },
        };
        let decoder = TokenDecoder::new(Box::new(HmacVerifier::new(KEY)));
        Engine::new(config, decoder, scorer, scanner, outbox)
    }

    #[test]
    fn test_frames_and_scan_produce_verified_record_end_to_end() {
        let outbox = Arc::new(Outbox::open_in_memory().unwrap());
        let scanner = OneShotScanner {
            text: Some(signed_token_text("S1", 0, 600_000)),
            fire_on_call: 1,
            calls: 0,
        };
        let scorer = ScriptedScorer(vec![0.9, 0.92, 0.95, 0.9]);
        let mut engine = engine_with(Box::new(scorer), Some(Box::new(scanner)), outbox.clone());
        let mut rx = engine.results_tx.subscribe();

        // Token decoded on the first frame, presence stabilizes on the third.
        for (i, at) in [1_000u64, 1_250, 1_500, 1_750].iter().enumerate() {
            engine.process_frame(&frame(i as u32, true), *at);
        }

        let result = rx.try_recv().expect("one result broadcast");
        assert_eq!(result.outcome, Outcome::Verified);
        assert_eq!(result.session_id, "S1");
        assert_eq!(result.verified_at_ms, 1_500);

        // The record reached the journal and replays into the store.
        assert_eq!(outbox.stats().unwrap().pending, 1);
        let store = MemoryStore::new();
        outbox
            .replay_pending(&store, &ReplayPolicy::default(), 2_000)
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_submitted_scan_without_presence_times_out() {
        let outbox = Arc::new(Outbox::open_in_memory().unwrap());
        let mut engine = engine_with(Box::new(NullScorer), None, outbox.clone());
        let mut rx = engine.results_tx.subscribe();

        assert!(engine.submit_scan(&signed_token_text("S1", 0, 600_000), 1_000));
        engine.tick(7_000);

        let result = rx.try_recv().unwrap();
        assert_eq!(result.outcome, Outcome::NoPresence);
        assert!(outbox.stats().unwrap().pending == 0, "timeouts are not recorded");
    }

    #[test]
    fn test_low_quality_frames_never_stabilize() {
        let outbox = Arc::new(Outbox::open_in_memory().unwrap());
        let scorer = ScriptedScorer(vec![0.99; 8]);
        let mut engine = engine_with(Box::new(scorer), None, outbox.clone());

        engine.submit_scan(&signed_token_text("S1", 0, 600_000), 1_000);
        for i in 0..8u32 {
            engine.process_frame(&frame(i, false), 1_100 + u64::from(i) * 100);
        }

        let status = engine.status();
        assert_eq!(status.frames_rejected, 8);
        assert!(status.correlation_pending, "token still waiting for presence");
    }

    #[test]
    fn test_duplicate_verification_is_single_record() {
        let outbox = Arc::new(Outbox::open_in_memory().unwrap());
        let scorer = ScriptedScorer(vec![0.9; 12]);
        let mut engine = engine_with(Box::new(scorer), None, outbox.clone());

        let text = signed_token_text("S1", 0, 600_000);
        engine.submit_scan(&text, 1_000);
        for i in 0..3u32 {
            engine.process_frame(&frame(i, true), 1_100 + u64::from(i) * 100);
        }
        // Re-verify against the same issued token.
        engine.submit_scan(&text, 2_000);
        for i in 3..6u32 {
            engine.process_frame(&frame(i, true), 2_100 + u64::from(i) * 100);
        }

        assert_eq!(engine.status().recent_results.len(), 2, "both outcomes reported");
        assert_eq!(outbox.stats().unwrap().pending, 1, "one logical record");
    }

    #[test]
    fn test_invalid_scan_text_rejected() {
        let outbox = Arc::new(Outbox::open_in_memory().unwrap());
        let mut engine = engine_with(Box::new(NullScorer), None, outbox);
        assert!(!engine.submit_scan("not a token", 1_000));
        assert!(!engine.submit_scan("S1|0|600000|forgedsig", 1_000));
    }
}
