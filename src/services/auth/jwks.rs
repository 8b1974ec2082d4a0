/*
 * Responsibility
 * - Fetch the remote JWKS document and turn it into verification keys
 * - Keep the current document behind a lock; swap it on refresh
 * - Refresh once per unknown kid (key rotation); the same kid refreshes at most once per interval
 * - Collapse concurrent refresh triggers into a single fetch
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::services::auth::decoder::KeyResolutionError;

// JWKS documents are small; anything larger is refused before the body is read.
const MAX_JWKS_BYTES: u64 = 512 * 1024;

/// Where the raw key-set document comes from.
#[async_trait]
pub trait KeySource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<JwksDocument, KeyResolutionError>;
}

/// Loosely typed document: entries that are not valid JWKs are skipped, not fatal.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JwksDocument {
    #[serde(default)]
    pub keys: Vec<serde_json::Value>,
}

/// Fetches the document over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpKeySource {
    client: Client,
    url: Url,
}

impl HttpKeySource {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("jwt-forward-auth/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<JwksDocument, KeyResolutionError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| KeyResolutionError::Unavailable(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(KeyResolutionError::Unavailable(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        if let Some(len) = response.content_length() {
            if len > MAX_JWKS_BYTES {
                return Err(KeyResolutionError::Unavailable(format!(
                    "document too large: {len} bytes"
                )));
            }
        }

        response
            .json::<JwksDocument>()
            .await
            .map_err(|e| KeyResolutionError::Unavailable(format!("invalid document: {e}")))
    }
}

/// One usable verification key.
#[derive(Clone)]
struct ResolvedKey {
    kid: Option<String>,
    // `alg` declared on the JWK, if any, as its JOSE name.
    alg: Option<String>,
    key: Arc<DecodingKey>,
}

/// An immutable snapshot of the key set.
pub struct KeySet {
    generation: u64,
    keys: Vec<ResolvedKey>,
}

enum Lookup {
    Found(Arc<DecodingKey>),
    Missing,
    Ambiguous(usize),
}

impl KeySet {
    fn from_document(document: JwksDocument, generation: u64) -> Self {
        let mut keys = Vec::with_capacity(document.keys.len());

        for raw in document.keys {
            let jwk: Jwk = match serde_json::from_value(raw) {
                Ok(jwk) => jwk,
                Err(e) => {
                    warn!(error = %e, "skipping unparseable jwk");
                    continue;
                }
            };

            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                debug!(kid = ?jwk.common.key_id, "skipping encryption key");
                continue;
            }

            let key = match DecodingKey::from_jwk(&jwk) {
                Ok(key) => key,
                Err(e) => {
                    warn!(kid = ?jwk.common.key_id, error = %e, "skipping unusable jwk");
                    continue;
                }
            };

            keys.push(ResolvedKey {
                kid: jwk.common.key_id.clone(),
                alg: jwk.common.key_algorithm.map(|alg| format!("{alg:?}")),
                key: Arc::new(key),
            });
        }

        Self { generation, keys }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn find(&self, kid: Option<&str>, alg: Algorithm) -> Lookup {
        let alg = format!("{alg:?}");
        let mut matches = self.keys.iter().filter(|candidate| {
            candidate.kid.as_deref() == kid
                && candidate.alg.as_deref().is_none_or(|declared| declared == alg)
        });

        match (matches.next(), matches.count()) {
            (None, _) => Lookup::Missing,
            (Some(found), 0) => Lookup::Found(found.key.clone()),
            (Some(_), rest) => Lookup::Ambiguous(rest + 1),
        }
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Do not print key material
        f.debug_struct("KeySet")
            .field("generation", &self.generation)
            .field(
                "kids",
                &self.keys.iter().map(|k| k.kid.as_deref()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Default)]
struct RefreshState {
    generation: u64,
    // When each unknown kid last triggered a fetch.
    kid_attempts: HashMap<Option<String>, Instant>,
}

/// Owns the current key set and every mutation of it.
///
/// Readers clone an `Arc<KeySet>` out of a read lock and never wait on the
/// network. Refreshes are serialized through `refresh_gate`; a caller that
/// waited on the gate while someone else fetched reuses that result.
pub struct KeyResolver {
    source: Arc<dyn KeySource>,
    current: RwLock<Option<Arc<KeySet>>>,
    refresh_gate: Mutex<RefreshState>,
    min_refresh_interval: Duration,
}

impl fmt::Debug for KeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyResolver")
            .field("min_refresh_interval", &self.min_refresh_interval)
            .finish_non_exhaustive()
    }
}

impl KeyResolver {
    pub fn new(source: Arc<dyn KeySource>, min_refresh_interval: Duration) -> Self {
        Self {
            source,
            current: RwLock::new(None),
            refresh_gate: Mutex::new(RefreshState::default()),
            min_refresh_interval,
        }
    }

    /// Current snapshot without touching the network.
    pub async fn snapshot(&self) -> Option<Arc<KeySet>> {
        self.current.read().await.clone()
    }

    /// Decoding key for a token header.
    ///
    /// Loads the key set on first use. An unknown `kid` triggers one refresh
    /// before giving up.
    pub async fn resolve(
        &self,
        kid: Option<&str>,
        alg: Algorithm,
    ) -> Result<Arc<DecodingKey>, KeyResolutionError> {
        let snapshot = match self.snapshot().await {
            Some(snapshot) => snapshot,
            None => self.refresh_after(None, kid).await?,
        };

        match snapshot.find(kid, alg) {
            Lookup::Found(key) => return Ok(key),
            Lookup::Ambiguous(count) => {
                return Err(KeyResolutionError::AmbiguousKey {
                    kid: kid.map(str::to_owned),
                    count,
                });
            }
            Lookup::Missing => {}
        }

        debug!(kid = ?kid, generation = snapshot.generation, "unknown kid, refreshing key set");
        let refreshed = self.refresh_after(Some(snapshot.generation), kid).await?;

        match refreshed.find(kid, alg) {
            Lookup::Found(key) => Ok(key),
            Lookup::Ambiguous(count) => Err(KeyResolutionError::AmbiguousKey {
                kid: kid.map(str::to_owned),
                count,
            }),
            Lookup::Missing => Err(KeyResolutionError::UnknownKey {
                kid: kid.map(str::to_owned),
            }),
        }
    }

    /// Unconditional fetch, used for the startup warm-up.
    pub async fn refresh(&self) -> Result<Arc<KeySet>, KeyResolutionError> {
        let mut gate = self.refresh_gate.lock().await;
        self.fetch_and_swap(&mut gate).await
    }

    /// Fetch a newer key set than `seen` on behalf of `kid`.
    ///
    /// - Nothing loaded yet: always fetch.
    /// - Someone else already fetched past `seen`: reuse their result.
    /// - `kid` already triggered a fetch within the interval: reuse the current set.
    async fn refresh_after(
        &self,
        seen: Option<u64>,
        kid: Option<&str>,
    ) -> Result<Arc<KeySet>, KeyResolutionError> {
        let mut gate = self.refresh_gate.lock().await;

        let Some(current) = self.snapshot().await else {
            return self.fetch_and_swap(&mut gate).await;
        };
        if seen.is_none_or(|generation| current.generation > generation) {
            return Ok(current);
        }

        let now = Instant::now();
        let interval = self.min_refresh_interval;
        gate.kid_attempts.retain(|_, at| now.duration_since(*at) < interval);

        let kid = kid.map(str::to_owned);
        if gate.kid_attempts.contains_key(&kid) {
            debug!(kid = ?kid, "kid refreshed recently, reusing current document");
            return Ok(current);
        }
        gate.kid_attempts.insert(kid, now);

        self.fetch_and_swap(&mut gate).await
    }

    async fn fetch_and_swap(
        &self,
        gate: &mut RefreshState,
    ) -> Result<Arc<KeySet>, KeyResolutionError> {
        let document = match self.source.fetch().await {
            Ok(document) => document,
            Err(err) => {
                warn!(error = %err, "key set refresh failed");
                metrics::counter!("jwt_forward_auth_jwks_refresh_total", "outcome" => "error")
                    .increment(1);
                return Err(err);
            }
        };

        gate.generation += 1;
        let set = Arc::new(KeySet::from_document(document, gate.generation));

        *self.current.write().await = Some(set.clone());

        if set.is_empty() {
            warn!(generation = set.generation, "key set refreshed but holds no usable keys");
        } else {
            info!(generation = set.generation, keys = set.len(), "key set refreshed");
        }
        metrics::counter!("jwt_forward_auth_jwks_refresh_total", "outcome" => "ok").increment(1);

        Ok(set)
    }
}
