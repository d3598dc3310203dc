//! Verification state machine.
//!
//! Fuses token scans and stable presence events into verification outcomes
//! under a correlation window `W`. One machine runs per capture session, fed
//! through a single-writer actor; transitions are a pure function of
//! `(state, event)` so the whole table is testable without I/O.
//!
//! ```text
//! Idle ──token──▶ AwaitingPresence ──presence ≤ W──▶ Verified | Expired
//!   │                   │
//!   │                   └──window elapses──▶ NoPresence
//!   └─presence─▶ AwaitingToken ──token ≤ W──▶ Verified | Expired
//!                        └──window elapses──▶ (discarded, back to Idle)
//! ```
//!
//! A signature-failed token reports `Mismatch` immediately without starting
//! or disturbing a window. Deadlines are enforced against every event's
//! timestamp, so a late complementary event can never slip into an elapsed
//! window even if no tick arrived in between.

use crate::presence::StablePresence;
use crate::token::{ScanOutcome, SessionToken};
use serde::Serialize;

/// Terminal outcome of one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Verified,
    Expired,
    NoPresence,
    Mismatch,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Verified => "verified",
            Outcome::Expired => "expired",
            Outcome::NoPresence => "no_presence",
            Outcome::Mismatch => "mismatch",
        };
        f.write_str(s)
    }
}

/// Immutable result of one correlation; the sole input to the recorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub session_id: String,
    pub subject_id: String,
    pub outcome: Outcome,
    pub verified_at_ms: u64,
    /// The token's issuance instant; the dedup epoch for attendance records.
    pub session_epoch_ms: u64,
}

/// Input to the state machine.
#[derive(Debug, Clone)]
pub enum VerifyEvent {
    /// A scan decoded (or failed to decode) at `at_ms`.
    Scan { outcome: ScanOutcome, at_ms: u64 },
    /// Debounced presence became stable.
    Presence(StablePresence),
    /// Clock advance; drives window timeouts when no other events arrive.
    Tick { now_ms: u64 },
}

impl VerifyEvent {
    fn at_ms(&self) -> u64 {
        match self {
            VerifyEvent::Scan { at_ms, .. } => *at_ms,
            VerifyEvent::Presence(p) => p.stable_at_ms,
            VerifyEvent::Tick { now_ms } => *now_ms,
        }
    }
}

/// Side effects requested by a transition. The caller reports results
/// upward and logs audit effects; the machine itself never does I/O.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Report(VerificationResult),
    /// A newer token replaced a pending one (latest-wins, never queued).
    TokenSuperseded { session_id: String },
    /// A stale stable presence was dropped without a token.
    PresenceDiscarded { stable_at_ms: u64 },
    /// A malformed scan was seen; state unchanged.
    MalformedScan { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    Idle,
    AwaitingPresence {
        token: SessionToken,
        deadline_ms: u64,
    },
    AwaitingToken {
        presence: StablePresence,
        deadline_ms: u64,
    },
}

/// Per-capture-session verification automaton.
pub struct Verifier {
    subject_id: String,
    window_ms: u64,
    state: State,
}

impl Verifier {
    pub fn new(subject_id: impl Into<String>, window_ms: u64) -> Self {
        Self {
            subject_id: subject_id.into(),
            window_ms,
            state: State::Idle,
        }
    }

    /// Whether a correlation is currently pending.
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Advance the machine by one event, returning the effects to perform.
    pub fn step(&mut self, event: VerifyEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.expire_if_due(event.at_ms(), &mut effects);

        match event {
            VerifyEvent::Tick { .. } => {}
            VerifyEvent::Scan { outcome, at_ms } => self.on_scan(outcome, at_ms, &mut effects),
            VerifyEvent::Presence(presence) => self.on_presence(presence, &mut effects),
        }

        effects
    }

    /// Resolve an elapsed window before handling the event itself.
    fn expire_if_due(&mut self, now_ms: u64, effects: &mut Vec<Effect>) {
        match &self.state {
            State::AwaitingPresence { token, deadline_ms } if now_ms > *deadline_ms => {
                let result = VerificationResult {
                    session_id: token.session_id.clone(),
                    subject_id: self.subject_id.clone(),
                    outcome: Outcome::NoPresence,
                    verified_at_ms: *deadline_ms,
                    session_epoch_ms: token.issued_at_ms,
                };
                tracing::info!(session = %result.session_id, "no stable presence within window");
                effects.push(Effect::Report(result));
                self.state = State::Idle;
            }
            State::AwaitingToken { presence, deadline_ms } if now_ms > *deadline_ms => {
                // Presence alone proves nothing about which session; discard
                // silently rather than reporting an outcome.
                effects.push(Effect::PresenceDiscarded {
                    stable_at_ms: presence.stable_at_ms,
                });
                tracing::debug!("stable presence discarded without a token");
                self.state = State::Idle;
            }
            _ => {}
        }
    }

    fn on_scan(&mut self, outcome: ScanOutcome, at_ms: u64, effects: &mut Vec<Effect>) {
        match outcome {
            ScanOutcome::NotFound => {}
            ScanOutcome::Malformed { reason } => {
                // Audited, never crashes the pipeline; the window (if any)
                // keeps running.
                effects.push(Effect::MalformedScan { reason });
            }
            ScanOutcome::BadSignature(token) => {
                // Forged or corrupt signature routes straight to Mismatch.
                // No timer starts and a pending valid correlation is kept.
                let result = VerificationResult {
                    session_id: token.session_id.clone(),
                    subject_id: self.subject_id.clone(),
                    outcome: Outcome::Mismatch,
                    verified_at_ms: at_ms,
                    session_epoch_ms: token.issued_at_ms,
                };
                tracing::warn!(session = %result.session_id, "token signature mismatch");
                effects.push(Effect::Report(result));
            }
            ScanOutcome::Token(token) => match std::mem::replace(&mut self.state, State::Idle) {
                State::Idle => {
                    self.state = State::AwaitingPresence {
                        deadline_ms: at_ms + self.window_ms,
                        token,
                    };
                }
                State::AwaitingPresence { token: pending, .. } => {
                    // Latest-wins: a subject attends exactly one session at a
                    // time, so the newer token supersedes, never queues.
                    effects.push(Effect::TokenSuperseded {
                        session_id: pending.session_id,
                    });
                    self.state = State::AwaitingPresence {
                        deadline_ms: at_ms + self.window_ms,
                        token,
                    };
                }
                State::AwaitingToken { .. } => {
                    effects.push(Effect::Report(self.correlate(&token, at_ms)));
                }
            },
        }
    }

    fn on_presence(&mut self, presence: StablePresence, effects: &mut Vec<Effect>) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => {
                self.state = State::AwaitingToken {
                    deadline_ms: presence.stable_at_ms + self.window_ms,
                    presence,
                };
            }
            State::AwaitingToken { presence: old, .. } => {
                // Fresher evidence replaces the pending signal and restarts
                // the window.
                effects.push(Effect::PresenceDiscarded {
                    stable_at_ms: old.stable_at_ms,
                });
                self.state = State::AwaitingToken {
                    deadline_ms: presence.stable_at_ms + self.window_ms,
                    presence,
                };
            }
            State::AwaitingPresence { token, .. } => {
                effects.push(Effect::Report(self.correlate(&token, presence.stable_at_ms)));
            }
        }
    }

    /// Evaluate a completed correlation. `Verified` only while the token's
    /// validity window contains the verification instant.
    fn correlate(&self, token: &SessionToken, verified_at_ms: u64) -> VerificationResult {
        let outcome = if token.is_valid_at(verified_at_ms) {
            Outcome::Verified
        } else {
            Outcome::Expired
        };
        let result = VerificationResult {
            session_id: token.session_id.clone(),
            subject_id: self.subject_id.clone(),
            outcome,
            verified_at_ms,
            session_epoch_ms: token.issued_at_ms,
        };
        tracing::info!(
            session = %result.session_id,
            subject = %result.subject_id,
            outcome = %result.outcome,
            verified_at_ms,
            "correlation complete"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u64 = 5_000;

    fn token(session: &str, issued: u64, expires: u64) -> SessionToken {
        SessionToken {
            session_id: session.into(),
            issued_at_ms: issued,
            expires_at_ms: expires,
            signature: "sig".into(),
        }
    }

    fn scan(t: SessionToken, at_ms: u64) -> VerifyEvent {
        VerifyEvent::Scan {
            outcome: ScanOutcome::Token(t),
            at_ms,
        }
    }

    fn presence(at_ms: u64) -> VerifyEvent {
        VerifyEvent::Presence(StablePresence {
            confidence: 0.95,
            stable_at_ms: at_ms,
        })
    }

    fn reports(effects: &[Effect]) -> Vec<&VerificationResult> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Report(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_token_then_presence_within_window_verifies() {
        // Spec scenario: token {S1, 0, 600000} at t=1000, presence at t=3000.
        let mut v = Verifier::new("stu-1", W);
        assert!(v.step(scan(token("S1", 0, 600_000), 1_000)).is_empty());

        let effects = v.step(presence(3_000));
        let rs = reports(&effects);
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].outcome, Outcome::Verified);
        assert_eq!(rs[0].session_id, "S1");
        assert_eq!(rs[0].subject_id, "stu-1");
        assert_eq!(rs[0].verified_at_ms, 3_000);
        assert_eq!(rs[0].session_epoch_ms, 0);
        assert!(v.is_idle());
    }

    #[test]
    fn test_presence_outside_window_is_no_presence() {
        // Spec scenario: presence stable at t=7000 with W=5000.
        let mut v = Verifier::new("stu-1", W);
        v.step(scan(token("S1", 0, 600_000), 1_000));

        let effects = v.step(presence(7_000));
        let rs = reports(&effects);
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].outcome, Outcome::NoPresence);
        assert_eq!(rs[0].verified_at_ms, 6_000, "timeout instant is the deadline");
        // The late presence opens a fresh token wait instead.
        assert!(!v.is_idle());
    }

    #[test]
    fn test_expired_token_correlates_as_expired() {
        // Spec scenario: token expiring at 500 decoded at t=1000.
        let mut v = Verifier::new("stu-1", W);
        v.step(scan(token("S1", 0, 500), 1_000));

        let effects = v.step(presence(1_200));
        let rs = reports(&effects);
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].outcome, Outcome::Expired);
    }

    #[test]
    fn test_presence_first_then_token_verifies() {
        let mut v = Verifier::new("stu-1", W);
        assert!(v.step(presence(2_000)).is_empty());

        let effects = v.step(scan(token("S2", 0, 600_000), 4_000));
        let rs = reports(&effects);
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].outcome, Outcome::Verified);
        assert_eq!(rs[0].verified_at_ms, 4_000);
    }

    #[test]
    fn test_presence_at_exact_window_edge_still_correlates() {
        let mut v = Verifier::new("stu-1", W);
        v.step(scan(token("S1", 0, 600_000), 1_000));
        let effects = v.step(presence(6_000));
        assert_eq!(reports(&effects)[0].outcome, Outcome::Verified);
    }

    #[test]
    fn test_latest_token_wins() {
        let mut v = Verifier::new("stu-1", W);
        v.step(scan(token("S1", 0, 600_000), 1_000));
        let effects = v.step(scan(token("S2", 0, 600_000), 2_000));
        assert_eq!(
            effects,
            vec![Effect::TokenSuperseded {
                session_id: "S1".into()
            }]
        );

        let effects = v.step(presence(3_000));
        let rs = reports(&effects);
        assert_eq!(rs.len(), 1, "superseded token must not produce a second result");
        assert_eq!(rs[0].session_id, "S2");
    }

    #[test]
    fn test_bad_signature_reports_mismatch_without_timer() {
        let mut v = Verifier::new("stu-1", W);
        let effects = v.step(VerifyEvent::Scan {
            outcome: ScanOutcome::BadSignature(token("S1", 0, 600_000)),
            at_ms: 1_000,
        });
        let rs = reports(&effects);
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].outcome, Outcome::Mismatch);
        assert!(v.is_idle(), "no window starts for a forged token");
    }

    #[test]
    fn test_bad_signature_keeps_pending_correlation() {
        let mut v = Verifier::new("stu-1", W);
        v.step(scan(token("S1", 0, 600_000), 1_000));

        let effects = v.step(VerifyEvent::Scan {
            outcome: ScanOutcome::BadSignature(token("S-forged", 0, 600_000)),
            at_ms: 2_000,
        });
        assert_eq!(reports(&effects)[0].outcome, Outcome::Mismatch);

        // The original window is still live.
        let effects = v.step(presence(3_000));
        let rs = reports(&effects);
        assert_eq!(rs[0].outcome, Outcome::Verified);
        assert_eq!(rs[0].session_id, "S1");
    }

    #[test]
    fn test_malformed_scan_leaves_state_untouched() {
        let mut v = Verifier::new("stu-1", W);
        v.step(scan(token("S1", 0, 600_000), 1_000));
        let effects = v.step(VerifyEvent::Scan {
            outcome: ScanOutcome::Malformed {
                reason: "garbage".into(),
            },
            at_ms: 2_000,
        });
        assert_eq!(
            effects,
            vec![Effect::MalformedScan {
                reason: "garbage".into()
            }]
        );
        assert!(!v.is_idle());
    }

    #[test]
    fn test_tick_drives_no_presence_timeout() {
        let mut v = Verifier::new("stu-1", W);
        v.step(scan(token("S1", 0, 600_000), 1_000));
        assert!(v.step(VerifyEvent::Tick { now_ms: 5_999 }).is_empty());

        let effects = v.step(VerifyEvent::Tick { now_ms: 6_001 });
        let rs = reports(&effects);
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].outcome, Outcome::NoPresence);
        assert!(v.is_idle());
    }

    #[test]
    fn test_stale_presence_discarded_silently() {
        let mut v = Verifier::new("stu-1", W);
        v.step(presence(1_000));
        let effects = v.step(VerifyEvent::Tick { now_ms: 6_001 });
        assert_eq!(
            effects,
            vec![Effect::PresenceDiscarded { stable_at_ms: 1_000 }]
        );
        assert!(v.is_idle());
    }

    #[test]
    fn test_fresh_presence_replaces_pending_presence() {
        let mut v = Verifier::new("stu-1", W);
        v.step(presence(1_000));
        let effects = v.step(presence(2_000));
        assert_eq!(
            effects,
            vec![Effect::PresenceDiscarded { stable_at_ms: 1_000 }]
        );

        // Window now runs from the fresh signal.
        let effects = v.step(scan(token("S3", 0, 600_000), 6_500));
        assert_eq!(reports(&effects)[0].outcome, Outcome::Verified);
    }

    #[test]
    fn test_verified_exactly_once_per_correlation() {
        let mut v = Verifier::new("stu-1", W);
        v.step(scan(token("S1", 0, 600_000), 1_000));
        let first = v.step(presence(2_000));
        assert_eq!(reports(&first).len(), 1);

        // A second stable presence after the correlation opens a new token
        // wait; it must not replay the previous result.
        let second = v.step(presence(2_500));
        assert!(reports(&second).is_empty());
    }
}
