//! JWKS fetching and caching

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey};
use parking_lot::RwLock;
use serde::Deserialize;
use url::Url;

use super::error::{AuthError, Result};

/// JSON Web Key
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key ID
    #[serde(default)]
    pub kid: Option<String>,
    /// Key type (RSA, EC, OKP)
    pub kty: String,
    /// Algorithm
    #[serde(default)]
    pub alg: Option<String>,
    /// Key usage
    #[serde(default)]
    pub r#use: Option<String>,
    // RSA components
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    // EC / OKP components
    #[serde(default)]
    pub crv: Option<String>,
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<String>,
}

/// JSON Web Key Set
#[derive(Debug, Clone, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// Source of key-set documents.
#[async_trait]
pub trait JwksFetcher: Send + Sync + std::fmt::Debug {
    async fn fetch(&self) -> Result<JwkSet>;
}

/// Fetches the key set over HTTPS.
#[derive(Debug)]
pub struct HttpJwksFetcher {
    jwks_uri: Url,
    client: reqwest::Client,
}

impl HttpJwksFetcher {
    pub fn new(jwks_uri: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AuthError::KeyResolutionFailed(format!("HTTP client: {e}")))?;
        Ok(Self { jwks_uri, client })
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self) -> Result<JwkSet> {
        let response = self
            .client
            .get(self.jwks_uri.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::KeyResolutionFailed(format!("JWKS fetch failed: {e}")))?;

        response
            .json()
            .await
            .map_err(|e| AuthError::KeyResolutionFailed(format!("JWKS parse failed: {e}")))
    }
}

/// JWKS entry with metadata
#[derive(Clone)]
struct JwkEntry {
    key: DecodingKey,
    algorithm: Algorithm,
}

impl std::fmt::Debug for JwkEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwkEntry")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Thread-safe key cache keyed by key id.
///
/// Entries stay valid for the process lifetime unless a `ttl` is set. An
/// unknown key id forces a refresh. Fetch attempts, failed or not, are
/// throttled to one per `min_refresh_interval`; concurrent refreshes are
/// coalesced.
pub struct JwksCache {
    keys: RwLock<HashMap<String, JwkEntry>>,
    fetcher: Arc<dyn JwksFetcher>,
    ttl: Option<Duration>,
    min_refresh_interval: Duration,
    last_refresh: RwLock<Option<Instant>>,
    last_attempt: RwLock<Option<Instant>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksCache")
            .field("fetcher", &self.fetcher)
            .field("ttl", &self.ttl)
            .field("keys_count", &self.keys.read().len())
            .finish_non_exhaustive()
    }
}

impl JwksCache {
    pub fn new(fetcher: Arc<dyn JwksFetcher>) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            fetcher,
            ttl: None,
            min_refresh_interval: Duration::from_secs(30),
            last_refresh: RwLock::new(None),
            last_attempt: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub const fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Get key for validation
    pub async fn get_key(&self, kid: &str, alg: Algorithm) -> Result<DecodingKey> {
        if !self.is_expired()
            && let Some(key) = self.lookup(kid, alg)?
        {
            return Ok(key);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another task may have refreshed while we waited.
        if !self.is_expired()
            && let Some(key) = self.lookup(kid, alg)?
        {
            return Ok(key);
        }

        if self.attempted_recently() {
            tracing::debug!(kid, "Key refresh throttled");
            return self
                .lookup(kid, alg)?
                .ok_or_else(|| AuthError::KeyResolutionFailed(format!("key not found: {kid}")));
        }

        self.refresh_locked().await?;

        self.lookup(kid, alg)?
            .ok_or_else(|| AuthError::KeyResolutionFailed(format!("key not found: {kid}")))
    }

    /// Refresh JWKS from remote
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<()> {
        tracing::debug!(fetcher = ?self.fetcher, "Refreshing JWKS");

        *self.last_attempt.write() = Some(Instant::now());
        let jwks = self.fetcher.fetch().await.inspect_err(|e| {
            tracing::warn!(error = %e, "JWKS refresh failed");
        })?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            let Some(kid) = jwk.kid.clone() else {
                tracing::debug!(kty = %jwk.kty, "Skipping key without kid");
                continue;
            };
            match decode_jwk(&jwk) {
                Ok(Some((key, algorithm))) => {
                    keys.insert(kid, JwkEntry { key, algorithm });
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(kid, error = %e, "Skipping malformed JWK"),
            }
        }

        let keys_count = keys.len();
        *self.keys.write() = keys;
        *self.last_refresh.write() = Some(Instant::now());

        tracing::info!(keys_count, "JWKS refreshed successfully");

        Ok(())
    }

    fn lookup(&self, kid: &str, alg: Algorithm) -> Result<Option<DecodingKey>> {
        let keys = self.keys.read();
        match keys.get(kid) {
            Some(entry) if entry.algorithm == alg => Ok(Some(entry.key.clone())),
            Some(entry) => Err(AuthError::KeyResolutionFailed(format!(
                "key {kid} is registered for {:?}, token uses {alg:?}",
                entry.algorithm
            ))),
            None => Ok(None),
        }
    }

    fn is_expired(&self) -> bool {
        match (self.ttl, *self.last_refresh.read()) {
            (Some(ttl), Some(at)) => at.elapsed() > ttl,
            _ => false,
        }
    }

    fn attempted_recently(&self) -> bool {
        self.last_attempt
            .read()
            .is_some_and(|t| t.elapsed() < self.min_refresh_interval)
    }

    #[cfg(test)]
    pub fn keys_count(&self) -> usize {
        self.keys.read().len()
    }
}

fn decode_jwk(jwk: &Jwk) -> Result<Option<(DecodingKey, Algorithm)>> {
    let alg = match jwk.alg.as_deref() {
        Some("RS256") => Algorithm::RS256,
        Some("RS384") => Algorithm::RS384,
        Some("RS512") => Algorithm::RS512,
        Some("ES256") => Algorithm::ES256,
        Some("ES384") => Algorithm::ES384,
        Some("EdDSA") => Algorithm::EdDSA,
        None => {
            // Infer from key type
            match jwk.kty.as_str() {
                "RSA" => Algorithm::RS256,
                "EC" => match jwk.crv.as_deref() {
                    Some("P-256") => Algorithm::ES256,
                    Some("P-384") => Algorithm::ES384,
                    _ => return Ok(None),
                },
                "OKP" if jwk.crv.as_deref() == Some("Ed25519") => Algorithm::EdDSA,
                _ => return Ok(None),
            }
        }
        _ => return Ok(None),
    };

    let key = match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk
                .n
                .as_ref()
                .ok_or_else(|| AuthError::KeyResolutionFailed("Missing 'n' in RSA key".into()))?;
            let e = jwk
                .e
                .as_ref()
                .ok_or_else(|| AuthError::KeyResolutionFailed("Missing 'e' in RSA key".into()))?;
            DecodingKey::from_rsa_components(n, e).map_err(|e| {
                AuthError::KeyResolutionFailed(format!("Invalid RSA components: {e}"))
            })?
        }
        "EC" => {
            let x = jwk
                .x
                .as_ref()
                .ok_or_else(|| AuthError::KeyResolutionFailed("Missing 'x' in EC key".into()))?;
            let y = jwk
                .y
                .as_ref()
                .ok_or_else(|| AuthError::KeyResolutionFailed("Missing 'y' in EC key".into()))?;
            DecodingKey::from_ec_components(x, y).map_err(|e| {
                AuthError::KeyResolutionFailed(format!("Invalid EC components: {e}"))
            })?
        }
        "OKP" => {
            let x = jwk
                .x
                .as_ref()
                .ok_or_else(|| AuthError::KeyResolutionFailed("Missing 'x' in OKP key".into()))?;
            DecodingKey::from_ed_components(x).map_err(|e| {
                AuthError::KeyResolutionFailed(format!("Invalid OKP components: {e}"))
            })?
        }
        other => {
            tracing::debug!(kty = other, "Skipping unsupported key type");
            return Ok(None);
        }
    };

    Ok(Some((key, alg)))
}

/// Key-set fetcher serving a fixed document, counting fetches.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct StaticJwksFetcher {
    pub jwks: parking_lot::Mutex<JwkSet>,
    pub fetches: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl StaticJwksFetcher {
    pub fn new(jwks: JwkSet) -> Self {
        Self {
            jwks: parking_lot::Mutex::new(jwks),
            fetches: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl JwksFetcher for StaticJwksFetcher {
    async fn fetch(&self) -> Result<JwkSet> {
        self.fetches
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.jwks.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys::test_keys::key_material;

    fn okp_jwk(kid: &str) -> Jwk {
        let jwk = key_material().jwk().clone();
        Jwk {
            kid: Some(kid.to_string()),
            kty: jwk.kty,
            alg: Some(jwk.alg),
            r#use: Some(jwk.key_use),
            n: None,
            e: None,
            crv: Some(jwk.crv),
            x: Some(jwk.x),
            y: None,
        }
    }

    /// Fetcher whose endpoint is down.
    #[derive(Debug, Default)]
    struct UnreachableFetcher {
        fetches: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl JwksFetcher for UnreachableFetcher {
        async fn fetch(&self) -> Result<JwkSet> {
            self.fetches
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(AuthError::KeyResolutionFailed("connection refused".into()))
        }
    }

    fn cache_with(keys: Vec<Jwk>) -> (Arc<StaticJwksFetcher>, JwksCache) {
        let fetcher = Arc::new(StaticJwksFetcher::new(JwkSet { keys }));
        let cache = JwksCache::new(fetcher.clone());
        (fetcher, cache)
    }

    #[test]
    fn test_jwk_set_deserialize() {
        let json = r#"{
            "keys": [
                {
                    "kid": "key1",
                    "kty": "RSA",
                    "alg": "RS256",
                    "n": "test_n",
                    "e": "AQAB"
                }
            ]
        }"#;
        let jwks: JwkSet = serde_json::from_str(json).unwrap();
        assert_eq!(jwks.keys.len(), 1);
        assert_eq!(jwks.keys[0].kid, Some("key1".to_string()));
        assert_eq!(jwks.keys[0].kty, "RSA");
    }

    #[test]
    fn test_decode_okp_key_infers_eddsa() {
        let mut jwk = okp_jwk("k1");
        jwk.alg = None;
        let (_, alg) = decode_jwk(&jwk).unwrap().unwrap();
        assert_eq!(alg, Algorithm::EdDSA);
    }

    #[test]
    fn test_decode_unknown_kty_skipped() {
        let jwk = Jwk {
            kid: Some("k".into()),
            kty: "oct".into(),
            alg: None,
            r#use: None,
            n: None,
            e: None,
            crv: None,
            x: None,
            y: None,
        };
        assert!(decode_jwk(&jwk).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keys_cached_after_first_fetch() {
        let (fetcher, cache) = cache_with(vec![okp_jwk("k1")]);

        cache.get_key("k1", Algorithm::EdDSA).await.unwrap();
        cache.get_key("k1", Algorithm::EdDSA).await.unwrap();
        cache.get_key("k1", Algorithm::EdDSA).await.unwrap();

        assert_eq!(fetcher.fetch_count(), 1);
        assert_eq!(cache.keys_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kid_forces_refresh_once() {
        let (fetcher, cache) = cache_with(vec![okp_jwk("k1")]);
        cache.get_key("k1", Algorithm::EdDSA).await.unwrap();

        // Rotation: the provider publishes k2
        fetcher.jwks.lock().keys.push(okp_jwk("k2"));
        let cache = cache.with_min_refresh_interval(Duration::ZERO);
        cache.get_key("k2", Algorithm::EdDSA).await.unwrap();
        assert_eq!(fetcher.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_kid_refresh_is_throttled() {
        let (fetcher, cache) = cache_with(vec![okp_jwk("k1")]);
        cache.get_key("k1", Algorithm::EdDSA).await.unwrap();

        for _ in 0..5 {
            let err = cache.get_key("missing", Algorithm::EdDSA).await.unwrap_err();
            assert!(matches!(err, AuthError::KeyResolutionFailed(_)));
        }
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_throttled() {
        let fetcher = Arc::new(UnreachableFetcher::default());
        let cache = JwksCache::new(fetcher.clone());

        for _ in 0..50 {
            let err = cache.get_key("k1", Algorithm::EdDSA).await.unwrap_err();
            assert!(matches!(err, AuthError::KeyResolutionFailed(_)));
        }
        assert_eq!(fetcher.fetches.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_retried_after_interval() {
        let fetcher = Arc::new(UnreachableFetcher::default());
        let cache = JwksCache::new(fetcher.clone()).with_min_refresh_interval(Duration::ZERO);

        cache.get_key("k1", Algorithm::EdDSA).await.unwrap_err();
        cache.get_key("k1", Algorithm::EdDSA).await.unwrap_err();
        assert_eq!(fetcher.fetches.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_algorithm_mismatch_rejected() {
        let (_, cache) = cache_with(vec![okp_jwk("k1")]);
        let err = cache.get_key("k1", Algorithm::RS256).await.unwrap_err();
        assert!(matches!(err, AuthError::KeyResolutionFailed(_)));
    }

    #[tokio::test]
    async fn test_ttl_expiry_triggers_refresh() {
        let (fetcher, cache) = cache_with(vec![okp_jwk("k1")]);
        let cache = cache
            .with_ttl(Some(Duration::ZERO))
            .with_min_refresh_interval(Duration::ZERO);

        cache.get_key("k1", Algorithm::EdDSA).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.get_key("k1", Algorithm::EdDSA).await.unwrap();
        assert_eq!(fetcher.fetch_count(), 2);
    }
}
