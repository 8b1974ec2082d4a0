//! How long a decode outcome may be served from the cache.
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::services::auth::decoder::DecodeResult;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheConfigError {
    #[error("cache capacity must be at least 1 (got {0})")]
    Capacity(u64),
    #[error("{0} must be greater than zero")]
    ZeroTtl(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    // Upper bound for any cached success.
    pub max_ttl: Duration,
    // Subtracted from `exp` so a cached token is dropped before it really expires.
    pub expiry_margin: Duration,
    // Lifetime of a cached failure.
    pub error_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_ttl: Duration::from_secs(60 * 60),
            expiry_margin: Duration::from_secs(120),
            error_ttl: Duration::from_secs(10 * 60),
        }
    }
}

impl CachePolicy {
    /// Reject bounds the cache cannot work with.
    pub fn validate(&self, capacity: u64) -> Result<(), CacheConfigError> {
        if capacity < 1 {
            return Err(CacheConfigError::Capacity(capacity));
        }
        if self.max_ttl.is_zero() {
            return Err(CacheConfigError::ZeroTtl("max ttl"));
        }
        if self.error_ttl.is_zero() {
            return Err(CacheConfigError::ZeroTtl("error ttl"));
        }
        Ok(())
    }

    /// TTL for `outcome` decoded at `now`. `Duration::ZERO` means "do not store".
    pub fn ttl_for(&self, outcome: &DecodeResult, now: DateTime<Utc>) -> Duration {
        match outcome {
            Err(_) => self.error_ttl,
            Ok(token) => match token.expiration {
                None => self.max_ttl,
                Some(expiration) => {
                    let remaining = (expiration - now).to_std().unwrap_or(Duration::ZERO);
                    remaining
                        .saturating_sub(self.expiry_margin)
                        .min(self.max_ttl)
                }
            },
        }
    }
}
