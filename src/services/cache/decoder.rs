//! Memoizing decorator around a [`TokenDecoder`].
//!
//! Outcomes (successes and failures) are cached per exact raw token string.
//! Concurrent misses for the same string share one verification: the first
//! caller spawns it, later callers subscribe to its result. The spawned task
//! is owned by the cache, so a caller going away does not cancel work other
//! callers are waiting on.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use moka::Expiry;
use moka::sync::Cache;
use tokio::sync::watch;

use crate::services::auth::decoder::{DecodeError, DecodeResult, TokenDecoder, fingerprint};
use crate::services::cache::policy::{CacheConfigError, CachePolicy};

type Flight = watch::Receiver<Option<DecodeResult>>;
type Inflight = Arc<Mutex<HashMap<String, Flight>>>;

#[derive(Debug, Clone)]
struct CachedOutcome {
    outcome: DecodeResult,
    ttl: Duration,
}

/// Each entry lives for the TTL computed when it was stored.
struct OutcomeExpiry;

impl Expiry<String, CachedOutcome> for OutcomeExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedOutcome,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    // A re-insert replaces the previous outcome, including its lifetime.
    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedOutcome,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Hit/miss counters. Mirrored into the Prometheus recorder when one is installed.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    fn record(&self, hit: bool) {
        let (counter, outcome) = if hit {
            (&self.hits, "hit")
        } else {
            (&self.misses, "miss")
        };
        counter.fetch_add(1, Ordering::Relaxed);

        metrics::counter!("jwt_forward_auth_cache_requests_total", "outcome" => outcome)
            .increment(1);
        metrics::gauge!("jwt_forward_auth_cache_hit_ratio").set(self.hit_ratio());
    }
}

pub struct CachedDecoder {
    inner: Arc<dyn TokenDecoder>,
    entries: Cache<String, CachedOutcome>,
    inflight: Inflight,
    policy: CachePolicy,
    stats: Arc<CacheStats>,
}

impl std::fmt::Debug for CachedDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedDecoder")
            .field("entries", &self.entries.entry_count())
            .field("policy", &self.policy)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl CachedDecoder {
    pub fn new(
        inner: Arc<dyn TokenDecoder>,
        capacity: u64,
        policy: CachePolicy,
    ) -> Result<Self, CacheConfigError> {
        policy.validate(capacity)?;

        let entries = Cache::builder()
            .max_capacity(capacity)
            .expire_after(OutcomeExpiry)
            .build();

        Ok(Self {
            inner,
            entries,
            inflight: Arc::default(),
            policy,
            stats: Arc::default(),
        })
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn cached(&self, raw: &str) -> Option<DecodeResult> {
        let entry = self.entries.get(raw)?;
        self.stats.record(true);
        Some(entry.outcome)
    }

    /// Join the verification already running for `raw`, or start one.
    fn join_or_start(&self, raw: &str) -> Result<Flight, DecodeResult> {
        let mut inflight = lock(&self.inflight);

        // A flight may have stored its outcome and left between our first
        // lookup and taking the lock.
        if let Some(outcome) = self.cached(raw) {
            return Err(outcome);
        }
        self.stats.record(false);

        if let Some(flight) = inflight.get(raw) {
            tracing::debug!(token = %fingerprint(raw), "joining in-flight verification");
            return Ok(flight.clone());
        }

        let (tx, rx) = watch::channel(None);
        inflight.insert(raw.to_owned(), rx.clone());
        drop(inflight);

        tracing::debug!(token = %fingerprint(raw), "cache miss, verifying");
        self.spawn_flight(raw.to_owned(), tx);
        Ok(rx)
    }

    fn spawn_flight(&self, raw: String, tx: watch::Sender<Option<DecodeResult>>) {
        let inner = Arc::clone(&self.inner);
        let entries = self.entries.clone();
        let policy = self.policy;
        let guard = FlightGuard {
            inflight: Arc::clone(&self.inflight),
            key: raw.clone(),
        };

        tokio::spawn(async move {
            let outcome = inner.decode(&raw).await;

            let ttl = policy.ttl_for(&outcome, Utc::now());
            if !ttl.is_zero() {
                entries.insert(
                    raw,
                    CachedOutcome {
                        outcome: outcome.clone(),
                        ttl,
                    },
                );
            }

            // Leave the in-flight table before publishing: from here on new
            // callers read the stored entry instead of joining.
            drop(guard);
            let _ = tx.send(Some(outcome));
        });
    }
}

#[async_trait]
impl TokenDecoder for CachedDecoder {
    async fn decode(&self, raw: &str) -> DecodeResult {
        if let Some(outcome) = self.cached(raw) {
            return outcome;
        }

        let mut flight = match self.join_or_start(raw) {
            Ok(flight) => flight,
            Err(outcome) => return outcome,
        };

        // Sender dropped without a value: the verification task panicked.
        match flight.wait_for(Option::is_some).await {
            Ok(published) => published.clone().unwrap_or(Err(DecodeError::Interrupted)),
            Err(_) => Err(DecodeError::Interrupted),
        }
    }
}

/// Removes the in-flight entry when the verification task ends, even by panic.
struct FlightGuard {
    inflight: Inflight,
    key: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        lock(&self.inflight).remove(&self.key);
    }
}

fn lock(inflight: &Inflight) -> MutexGuard<'_, HashMap<String, Flight>> {
    // The table holds no invariant a panicking holder could break.
    inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
