//! Session token decoding and signature verification.
//!
//! A session token names the event being attended and is scanned from a QR
//! code. Two wire formats are accepted, mirroring the tolerance of the
//! issuing apps in the field:
//!
//! 1. JSON: `{"sessionId":"S1","issuedAt":0,"expiresAt":600000,"sig":"…"}`
//! 2. Pipe-separated: `S1|0|600000|sig`
//!
//! Decoding is a pure function of the scanned text. A malformed payload is
//! reported distinctly from "no code present" so forged or corrupt scans
//! stay visible in the audit trail.

use serde::Deserialize;
use sha2::{Digest, Sha256};

/// A decoded, immutable session token.
///
/// Invariant (enforced at decode time): `expires_at_ms > issued_at_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub session_id: String,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
    /// Signature over [`canonical`](Self::canonical), hex-encoded.
    pub signature: String,
}

impl SessionToken {
    /// The byte string the signature covers.
    pub fn canonical(&self) -> String {
        format!(
            "{}|{}|{}",
            self.session_id, self.issued_at_ms, self.expires_at_ms
        )
    }

    /// Whether the token's validity window contains `now_ms`.
    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms >= self.issued_at_ms && now_ms <= self.expires_at_ms
    }
}

/// Capability that checks a token signature. Key material and algorithm
/// choice belong to the wider system; the core only needs the yes/no.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, canonical: &str, signature_hex: &str) -> bool;
}

/// Capability that finds a scannable code in a luma frame, returning its raw
/// text. Absent in deployments where the UI layer submits scans directly.
pub trait CodeScanner: Send {
    fn scan(&mut self, luma: &[u8], width: u32, height: u32) -> Option<String>;
}

/// Default verifier: HMAC-SHA256 over the canonical payload with a shared key.
pub struct HmacVerifier {
    key: Vec<u8>,
}

impl HmacVerifier {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Produce the hex signature for a canonical payload. Used by token
    /// issuers and tests; the daemon only ever verifies.
    pub fn sign(&self, canonical: &str) -> String {
        to_hex(&hmac_sha256(&self.key, canonical.as_bytes()))
    }
}

impl SignatureVerifier for HmacVerifier {
    fn verify(&self, canonical: &str, signature_hex: &str) -> bool {
        let expected = self.sign(canonical);
        let given = signature_hex.to_ascii_lowercase();
        if expected.len() != given.len() {
            return false;
        }
        // Constant-time comparison: fold over every byte, no early exit.
        expected
            .bytes()
            .zip(given.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// HMAC-SHA256 (RFC 2104) built on the sha2 crate.
fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    const BLOCK: usize = 64;

    let mut key_block = [0u8; BLOCK];
    if key.len() > BLOCK {
        let digest = Sha256::digest(key);
        key_block[..32].copy_from_slice(&digest);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    let ipad: Vec<u8> = key_block.iter().map(|b| b ^ 0x36).collect();
    inner.update(&ipad);
    inner.update(message);
    let inner_digest = inner.finalize();

    let mut outer = Sha256::new();
    let opad: Vec<u8> = key_block.iter().map(|b| b ^ 0x5c).collect();
    outer.update(&opad);
    outer.update(inner_digest);
    outer.finalize().into()
}

/// Lowercase hex encoding.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Result of decoding one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Well-formed token with a valid signature. Expiry is NOT checked here;
    /// the state machine evaluates it at correlation time.
    Token(SessionToken),
    /// No code present in the input.
    NotFound,
    /// Corrupt or unrecognized payload. Audit-worthy, distinct from NotFound.
    Malformed { reason: String },
    /// Well-formed token whose signature check failed.
    BadSignature(SessionToken),
}

/// JSON wire shape for the token payload.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenWire {
    session_id: String,
    issued_at: u64,
    expires_at: u64,
    sig: String,
}

/// Decodes scanned text into session tokens.
pub struct TokenDecoder {
    verifier: Box<dyn SignatureVerifier>,
}

impl TokenDecoder {
    pub fn new(verifier: Box<dyn SignatureVerifier>) -> Self {
        Self { verifier }
    }

    /// Decode one raw scan payload.
    pub fn decode(&self, raw: &str) -> ScanOutcome {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return ScanOutcome::NotFound;
        }

        let parsed = if trimmed.starts_with('{') {
            Self::parse_json(trimmed)
        } else if trimmed.contains('|') {
            Self::parse_pipe(trimmed)
        } else {
            Err("unrecognized token format".to_string())
        };

        let token = match parsed {
            Ok(token) => token,
            Err(reason) => {
                tracing::warn!(%reason, "malformed scan payload");
                return ScanOutcome::Malformed { reason };
            }
        };

        if token.expires_at_ms <= token.issued_at_ms {
            return ScanOutcome::Malformed {
                reason: format!(
                    "expiry {} not after issuance {}",
                    token.expires_at_ms, token.issued_at_ms
                ),
            };
        }

        if !self.verifier.verify(&token.canonical(), &token.signature) {
            tracing::warn!(session = %token.session_id, "token signature check failed");
            return ScanOutcome::BadSignature(token);
        }

        ScanOutcome::Token(token)
    }

    fn parse_json(raw: &str) -> Result<SessionToken, String> {
        let wire: TokenWire =
            serde_json::from_str(raw).map_err(|e| format!("invalid JSON token: {e}"))?;
        if wire.session_id.is_empty() {
            return Err("empty sessionId".to_string());
        }
        Ok(SessionToken {
            session_id: wire.session_id,
            issued_at_ms: wire.issued_at,
            expires_at_ms: wire.expires_at,
            signature: wire.sig,
        })
    }

    fn parse_pipe(raw: &str) -> Result<SessionToken, String> {
        let parts: Vec<&str> = raw.split('|').collect();
        if parts.len() != 4 {
            return Err(format!("pipe format needs 4 fields, got {}", parts.len()));
        }
        let session_id = parts[0].trim();
        if session_id.is_empty() {
            return Err("empty sessionId".to_string());
        }
        let issued_at_ms: u64 = parts[1]
            .trim()
            .parse()
            .map_err(|_| format!("bad issuedAt: {:?}", parts[1]))?;
        let expires_at_ms: u64 = parts[2]
            .trim()
            .parse()
            .map_err(|_| format!("bad expiresAt: {:?}", parts[2]))?;
        Ok(SessionToken {
            session_id: session_id.to_string(),
            issued_at_ms,
            expires_at_ms,
            signature: parts[3].trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(key: &str) -> TokenDecoder {
        TokenDecoder::new(Box::new(HmacVerifier::new(key.as_bytes().to_vec())))
    }

    fn signed_pipe(key: &str, session: &str, issued: u64, expires: u64) -> String {
        let sig = HmacVerifier::new(key.as_bytes().to_vec())
            .sign(&format!("{session}|{issued}|{expires}"));
        format!("{session}|{issued}|{expires}|{sig}")
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case_2() {
        // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?"
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            to_hex(&mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_hmac_sha256_long_key_is_hashed() {
        let long_key = vec![0xaau8; 131];
        let short = hmac_sha256(&Sha256::digest(&long_key), b"msg");
        let long = hmac_sha256(&long_key, b"msg");
        assert_eq!(short, long);
    }

    #[test]
    fn test_decode_pipe_format() {
        let raw = signed_pipe("k1", "S1", 0, 600_000);
        match decoder("k1").decode(&raw) {
            ScanOutcome::Token(t) => {
                assert_eq!(t.session_id, "S1");
                assert_eq!(t.issued_at_ms, 0);
                assert_eq!(t.expires_at_ms, 600_000);
            }
            other => panic!("expected Token, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_json_format() {
        let sig = HmacVerifier::new(b"k1".to_vec()).sign("S9|100|200");
        let raw = format!(
            r#"{{"sessionId":"S9","issuedAt":100,"expiresAt":200,"sig":"{sig}"}}"#
        );
        match decoder("k1").decode(&raw) {
            ScanOutcome::Token(t) => assert_eq!(t.session_id, "S9"),
            other => panic!("expected Token, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_empty_is_not_found() {
        assert_eq!(decoder("k").decode("   "), ScanOutcome::NotFound);
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        assert!(matches!(
            decoder("k").decode("not-a-token"),
            ScanOutcome::Malformed { .. }
        ));
        assert!(matches!(
            decoder("k").decode("{broken json"),
            ScanOutcome::Malformed { .. }
        ));
        assert!(matches!(
            decoder("k").decode("S1|zero|100|sig"),
            ScanOutcome::Malformed { .. }
        ));
    }

    #[test]
    fn test_decode_expiry_not_after_issuance_is_malformed() {
        let raw = signed_pipe("k1", "S1", 500, 500);
        assert!(matches!(
            decoder("k1").decode(&raw),
            ScanOutcome::Malformed { .. }
        ));
    }

    #[test]
    fn test_decode_wrong_key_is_bad_signature() {
        let raw = signed_pipe("issuer-key", "S1", 0, 1000);
        match decoder("other-key").decode(&raw) {
            ScanOutcome::BadSignature(t) => assert_eq!(t.session_id, "S1"),
            other => panic!("expected BadSignature, got {other:?}"),
        }
    }

    #[test]
    fn test_signature_case_insensitive_hex() {
        let canonical = "S1|0|1000";
        let verifier = HmacVerifier::new(b"k".to_vec());
        let sig = verifier.sign(canonical).to_uppercase();
        assert!(verifier.verify(canonical, &sig));
    }

    #[test]
    fn test_validity_window() {
        let t = SessionToken {
            session_id: "S1".into(),
            issued_at_ms: 100,
            expires_at_ms: 200,
            signature: String::new(),
        };
        assert!(!t.is_valid_at(99));
        assert!(t.is_valid_at(100));
        assert!(t.is_valid_at(200));
        assert!(!t.is_valid_at(201));
    }
}
