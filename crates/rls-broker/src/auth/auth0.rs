//! Auth0 token verification

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use url::Url;

use super::claims::ExternalClaims;
use super::error::{AuthError, Result};
use super::jwks::{HttpJwksFetcher, JwksCache};
use super::provider::Provider;
use super::verifier::{TokenVerifier, check_compact_structure};

/// Auth0 tenant settings.
#[derive(Debug, Clone)]
pub struct Auth0Config {
    /// Tenant domain, e.g. `example.eu.auth0.com`
    pub domain: String,
    /// Accepted audiences
    pub audience: Vec<String>,
    /// Accepted signing algorithms
    pub algorithms: Vec<Algorithm>,
    /// Clock skew tolerance
    pub clock_skew: Duration,
    /// Accept any audience. Test environments only.
    pub insecure_relaxed_audience: bool,
    /// Key-set cache TTL; `None` keeps keys for the process lifetime
    pub jwks_ttl: Option<Duration>,
    /// Minimum spacing between forced key-set refreshes
    pub min_refresh_interval: Duration,
    /// Key-set fetch timeout
    pub fetch_timeout: Duration,
}

impl Auth0Config {
    pub fn new(domain: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            audience: vec![audience.into()],
            algorithms: vec![Algorithm::RS256],
            clock_skew: Duration::from_secs(30),
            insecure_relaxed_audience: false,
            jwks_ttl: None,
            min_refresh_interval: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
        }
    }

    fn host(&self) -> &str {
        self.domain
            .trim_start_matches("https://")
            .trim_end_matches('/')
    }

    /// Issuer claim Auth0 puts on its tokens, trailing slash included.
    pub fn issuer(&self) -> String {
        format!("https://{}/", self.host())
    }

    pub fn jwks_uri(&self) -> Result<Url> {
        Url::parse(&format!("https://{}/.well-known/jwks.json", self.host()))
            .map_err(|e| AuthError::KeyResolutionFailed(format!("invalid Auth0 domain: {e}")))
    }
}

/// Verifies Auth0-issued access tokens against the tenant's key set.
#[derive(Debug)]
pub struct Auth0Verifier {
    config: Auth0Config,
    jwks: Arc<JwksCache>,
}

impl Auth0Verifier {
    pub fn new(config: Auth0Config) -> Result<Self> {
        let fetcher = HttpJwksFetcher::new(config.jwks_uri()?, config.fetch_timeout)?;
        let jwks = JwksCache::new(Arc::new(fetcher))
            .with_ttl(config.jwks_ttl)
            .with_min_refresh_interval(config.min_refresh_interval);
        Ok(Self::with_cache(config, Arc::new(jwks)))
    }

    pub fn with_cache(config: Auth0Config, jwks: Arc<JwksCache>) -> Self {
        if config.insecure_relaxed_audience {
            tracing::warn!(
                domain = %config.domain,
                "Audience validation disabled (insecure_relaxed_audience); test environments only"
            );
        }
        Self { config, jwks }
    }

    pub const fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.set_issuer(&[self.config.issuer()]);
        if self.config.insecure_relaxed_audience {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.config.audience);
        }
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);
        validation.validate_nbf = true;
        validation.leeway = self.config.clock_skew.as_secs();
        validation
    }
}

#[async_trait]
impl TokenVerifier for Auth0Verifier {
    fn provider(&self) -> Provider {
        Provider::Auth0
    }

    async fn verify(&self, token: &str) -> Result<ExternalClaims> {
        check_compact_structure(token)?;
        let header =
            decode_header(token).map_err(|e| AuthError::InvalidTokenFormat(e.to_string()))?;

        if !self.config.algorithms.contains(&header.alg) {
            return Err(AuthError::SignatureInvalid);
        }
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| AuthError::InvalidTokenFormat("missing kid".into()))?;

        let key = self.jwks.get_key(kid, header.alg).await?;
        let data = decode::<ExternalClaims>(token, &key, &self.validation(header.alg))?;

        tracing::debug!(sub = %data.claims.sub, kid, "Auth0 token verified");
        Ok(data.claims)
    }
}
