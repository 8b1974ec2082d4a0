//! Decoder seam shared by the verifier, the result cache and the decision handler.
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Outcome of a single decode call.
///
/// Successful tokens are handed out behind an `Arc` so the cache and every
/// concurrent waiter share one allocation.
pub type DecodeResult = Result<Arc<VerifiedToken>, DecodeError>;

/// A token that passed signature, structure and expiration checks.
///
/// `claims` is keyed by destination header name (lowercase) and only holds
/// mappings whose source claim resolved to a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub expiration: Option<DateTime<Utc>>,
    pub claims: BTreeMap<String, String>,
}

impl VerifiedToken {
    pub fn new(expiration: Option<DateTime<Utc>>, claims: BTreeMap<String, String>) -> Self {
        Self { expiration, claims }
    }
}

/// Failures while resolving verification keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyResolutionError {
    #[error("key set unavailable: {0}")]
    Unavailable(String),
    #[error("no usable key for kid {kid:?}")]
    UnknownKey { kid: Option<String> },
    #[error("{count} keys match kid {kid:?}")]
    AmbiguousKey { kid: Option<String>, count: usize },
}

/// Request-scoped verification failures. Every variant ends in `401`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error(transparent)]
    KeyResolution(#[from] KeyResolutionError),
    #[error("invalid signature: {0}")]
    SignatureInvalid(String),
    #[error("token is expired (expired at: {})", .expired_at.to_rfc3339())]
    Expired { expired_at: DateTime<Utc> },
    #[error("claim {claim} cannot be used as a header value: {reason}")]
    ClaimType { claim: String, reason: String },
    #[error("header {header} is filled by more than one claim: {sources:?}")]
    ClaimMapping { header: String, sources: Vec<String> },
    #[error("verification was interrupted")]
    Interrupted,
}

impl DecodeError {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_token",
            Self::KeyResolution(_) => "key_resolution",
            Self::SignatureInvalid(_) => "signature_invalid",
            Self::Expired { .. } => "token_expired",
            Self::ClaimType { .. } => "claim_type",
            Self::ClaimMapping { .. } => "claim_mapping",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Anything that turns a raw bearer token into a [`VerifiedToken`].
///
/// Implemented by the signature verifier and by the result cache that
/// decorates it, so the decision handler never knows which one it holds.
#[async_trait]
pub trait TokenDecoder: Send + Sync + 'static {
    async fn decode(&self, raw: &str) -> DecodeResult;
}

/// Short, non-reversible identifier for a raw token, safe to put in logs.
pub fn fingerprint(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..9])
}
