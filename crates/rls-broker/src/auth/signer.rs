//! Internal database credential signing

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, Header, Validation, decode, encode};
use rand::Rng;

use super::claims::{ExternalClaims, InternalClaims, MappedIdentity};
use super::error::{AuthError, Result};
use super::keys::KeyMaterial;

/// Input for one internal credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub subject: String,
    pub tenant_id: String,
    pub role: String,
    /// Defaults to the signing time
    pub not_before: Option<i64>,
    /// Upper bound for the credential's expiry
    pub expiry: i64,
    /// Reused when the provider issued a numeric token id
    pub token_id: Option<i64>,
}

impl SignRequest {
    pub fn from_external(claims: &ExternalClaims, identity: MappedIdentity) -> Self {
        Self {
            subject: claims.sub.clone(),
            tenant_id: identity.tenant_id,
            role: identity.role,
            not_before: claims.nbf,
            expiry: claims.exp,
            token_id: claims.numeric_jti(),
        }
    }
}

/// Signed internal credential.
///
/// Deliberately not `Clone`: a minted credential backs exactly one
/// transaction.
pub struct InternalToken {
    raw: String,
    claims: InternalClaims,
}

impl fmt::Debug for InternalToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalToken")
            .field("claims", &self.claims)
            .field("raw", &"<redacted>")
            .finish()
    }
}

impl InternalToken {
    /// Parse a previously minted credential, checking signature and validity
    /// window against our own key.
    pub fn parse(keys: &KeyMaterial, raw: &str) -> Result<Self> {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_aud = false;
        validation.validate_nbf = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "nbf", "sub"]);

        let data = decode::<InternalClaims>(raw, &keys.decoding_key(), &validation)?;
        Ok(Self {
            raw: raw.to_string(),
            claims: data.claims,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub const fn claims(&self) -> &InternalClaims {
        &self.claims
    }
}

/// Mints internal credentials with the process signing key.
#[derive(Debug, Clone)]
pub struct InternalTokenSigner {
    keys: Arc<KeyMaterial>,
    kid: String,
    max_ttl: Option<Duration>,
}

impl InternalTokenSigner {
    pub fn new(keys: Arc<KeyMaterial>, kid: impl Into<String>) -> Self {
        Self {
            keys,
            kid: kid.into(),
            max_ttl: None,
        }
    }

    /// Cap credential lifetime below the external token's expiry.
    #[must_use]
    pub const fn with_max_ttl(mut self, max_ttl: Option<Duration>) -> Self {
        self.max_ttl = max_ttl;
        self
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    pub fn sign(&self, request: SignRequest) -> Result<InternalToken> {
        let now_ms = unix_millis();
        let now = now_ms / 1000;

        let exp = match self.max_ttl {
            Some(ttl) => request.expiry.min(now + ttl.as_secs() as i64),
            None => request.expiry,
        };
        if exp <= now {
            return Err(AuthError::ClaimInvalid("credential would already be expired".into()));
        }

        let claims = InternalClaims {
            sub: request.subject,
            jti: request.token_id.unwrap_or_else(|| synthesize_token_id(now_ms)),
            iat: now,
            nbf: request.not_before.unwrap_or(now),
            exp,
            tenant_id: request.tenant_id,
            role: request.role,
        };

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.kid.clone());

        let raw = encode(&header, &claims, self.keys.encoding_key())
            .map_err(|e| AuthError::SigningFailed(e.to_string()))?;

        tracing::debug!(
            sub = %claims.sub,
            tenant_id = %claims.tenant_id,
            jti = claims.jti,
            exp = claims.exp,
            "Internal credential signed"
        );

        Ok(InternalToken { raw, claims })
    }
}

/// Whole-second millisecond timestamp plus a random 0..999 component.
fn synthesize_token_id(now_ms: i64) -> i64 {
    (now_ms / 1000) * 1000 + rand::rng().random_range(0..1000)
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
