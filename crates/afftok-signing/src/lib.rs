#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **afftok-signing** – Request signing for outbound postbacks and
//! verification of inbound ones.
//!
//! Outbound steps carry an HMAC-SHA256 signature over the canonicalized
//! body in `X-Signature`, plus metadata headers identifying the task,
//! pipeline, execution, step and attempt. Inbound verification is constant
//! time; a signature comparison must never leak how many bytes matched.

use std::collections::HashMap;

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

use afftok_types::SigningMode;

type HmacSha256 = Hmac<Sha256>;

//─────────────────────────────
//  Header names
//─────────────────────────────

/// Signature header.
pub const HEADER_SIGNATURE: &str = "X-Signature";
/// Task id header.
pub const HEADER_TASK_ID: &str = "X-Task-Id";
/// Pipeline id header.
pub const HEADER_PIPELINE_ID: &str = "X-Pipeline-Id";
/// Execution id header.
pub const HEADER_EXECUTION_ID: &str = "X-Execution-Id";
/// Step index header.
pub const HEADER_STEP_INDEX: &str = "X-Step-Index";
/// Attempt number header.
pub const HEADER_ATTEMPT: &str = "X-Attempt";
/// Unix-seconds timestamp header.
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
/// Random nonce header.
pub const HEADER_NONCE: &str = "X-Nonce";

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Result type alias for signing operations
pub type SignResult<T> = Result<T, SignError>;

/// Errors surfaced by the signer
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    /// The step references a key handle the ring does not hold
    #[error("unknown signing key handle: {0}")]
    UnknownKey(String),
    /// A signing step did not name a key handle
    #[error("signing requested but no key handle configured")]
    MissingKeyHandle,
    /// The HMAC backend rejected the key
    #[error("signing key rejected: {0}")]
    InvalidKey(String),
}

//─────────────────────────────
//  Key ring
//─────────────────────────────

/// Holds signing secrets by handle. Secrets never appear in logs; the
/// ring's `Debug` output shows handles only.
#[derive(Default, Clone)]
pub struct KeyRing {
    keys: HashMap<String, Vec<u8>>,
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("handles", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl KeyRing {
    /// An empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret under a handle.
    pub fn insert(&mut self, handle: impl Into<String>, secret: impl Into<Vec<u8>>) {
        self.keys.insert(handle.into(), secret.into());
    }

    /// Look up a secret.
    pub fn resolve(&self, handle: &str) -> Option<&[u8]> {
        self.keys.get(handle).map(|k| k.as_slice())
    }
}

//─────────────────────────────
//  Signing
//─────────────────────────────

/// Identity of the attempt being signed, flattened into metadata headers.
#[derive(Debug, Clone, Copy)]
pub struct SigningMeta {
    /// The task making the request.
    pub task_id: Uuid,
    /// The pipeline being executed.
    pub pipeline_id: Uuid,
    /// The execution the step belongs to.
    pub execution_id: Uuid,
    /// Step index within the pipeline.
    pub step_index: u32,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Signs outbound requests against a [`KeyRing`].
#[derive(Debug, Clone, Default)]
pub struct RequestSigner {
    ring: KeyRing,
}

impl RequestSigner {
    /// Create a signer over the given ring.
    pub fn new(ring: KeyRing) -> Self {
        Self { ring }
    }

    /// Produce the headers for one step attempt: metadata always, plus
    /// `X-Signature` when the step's signing mode asks for it.
    pub fn sign(
        &self,
        mode: SigningMode,
        body: &[u8],
        key_handle: Option<&str>,
        meta: &SigningMeta,
    ) -> SignResult<Vec<(String, String)>> {
        let mut headers = vec![
            (HEADER_TASK_ID.to_string(), meta.task_id.to_string()),
            (HEADER_PIPELINE_ID.to_string(), meta.pipeline_id.to_string()),
            (
                HEADER_EXECUTION_ID.to_string(),
                meta.execution_id.to_string(),
            ),
            (HEADER_STEP_INDEX.to_string(), meta.step_index.to_string()),
            (HEADER_ATTEMPT.to_string(), meta.attempt.to_string()),
            (
                HEADER_TIMESTAMP.to_string(),
                Utc::now().timestamp().to_string(),
            ),
            (HEADER_NONCE.to_string(), nonce()),
        ];
        if mode == SigningMode::HmacSha256 {
            let handle = key_handle.ok_or(SignError::MissingKeyHandle)?;
            let key = self
                .ring
                .resolve(handle)
                .ok_or_else(|| SignError::UnknownKey(handle.to_string()))?;
            headers.push((HEADER_SIGNATURE.to_string(), compute_signature(body, key)?));
        }
        Ok(headers)
    }

    /// Verify an inbound signature against the key under `handle`, in
    /// constant time. Unknown handles verify as false.
    pub fn verify(&self, body: &[u8], signature_hex: &str, handle: &str) -> bool {
        match self.ring.resolve(handle) {
            Some(key) => verify_signature(body, signature_hex, key),
            None => false,
        }
    }
}

/// Hex HMAC-SHA256 of `body` under `key`.
pub fn compute_signature(body: &[u8], key: &[u8]) -> SignResult<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| SignError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of a hex signature.
pub fn verify_signature(body: &[u8], signature_hex: &str, key: &[u8]) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> SigningMeta {
        SigningMeta {
            task_id: Uuid::new_v4(),
            pipeline_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            step_index: 2,
            attempt: 1,
        }
    }

    #[test]
    fn signed_request_verifies() {
        let mut ring = KeyRing::new();
        ring.insert("adv-1", b"secret".to_vec());
        let signer = RequestSigner::new(ring);

        let body = br#"{"click_id":"abc","amount":"9.90"}"#;
        let headers = signer
            .sign(SigningMode::HmacSha256, body, Some("adv-1"), &meta())
            .unwrap();
        let signature = headers
            .iter()
            .find(|(name, _)| name == HEADER_SIGNATURE)
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(signer.verify(body, &signature, "adv-1"));
        assert!(!signer.verify(b"tampered", &signature, "adv-1"));
        assert!(!signer.verify(body, &signature, "adv-2"));
    }

    #[test]
    fn metadata_headers_are_always_present() {
        let signer = RequestSigner::default();
        let headers = signer
            .sign(SigningMode::None, b"", None, &meta())
            .unwrap();
        for name in [
            HEADER_TASK_ID,
            HEADER_PIPELINE_ID,
            HEADER_EXECUTION_ID,
            HEADER_STEP_INDEX,
            HEADER_ATTEMPT,
            HEADER_TIMESTAMP,
            HEADER_NONCE,
        ] {
            assert!(headers.iter().any(|(n, _)| n == name), "missing {name}");
        }
        assert!(!headers.iter().any(|(n, _)| n == HEADER_SIGNATURE));
    }

    #[test]
    fn signing_without_a_key_handle_is_an_error() {
        let signer = RequestSigner::default();
        let err = signer
            .sign(SigningMode::HmacSha256, b"x", None, &meta())
            .unwrap_err();
        assert!(matches!(err, SignError::MissingKeyHandle));

        let err = signer
            .sign(SigningMode::HmacSha256, b"x", Some("ghost"), &meta())
            .unwrap_err();
        assert!(matches!(err, SignError::UnknownKey(_)));
    }

    #[test]
    fn malformed_hex_never_verifies() {
        assert!(!verify_signature(b"body", "not-hex!", b"key"));
    }
}
