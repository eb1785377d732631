//! External token verification

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use super::claims::ExternalClaims;
use super::error::{AuthError, Result};
use super::provider::Provider;

/// Verifies bearer tokens issued by one identity provider.
#[async_trait]
pub trait TokenVerifier: Send + Sync + fmt::Debug {
    fn provider(&self) -> Provider;

    /// Verify signature, issuer, audience and validity window.
    async fn verify(&self, token: &str) -> Result<ExternalClaims>;
}

/// Verifiers by provider. Providers without a registered verifier are
/// rejected with [`AuthError::UnsupportedProvider`].
#[derive(Default, Clone)]
pub struct VerifierRegistry {
    verifiers: HashMap<Provider, Arc<dyn TokenVerifier>>,
}

impl fmt::Debug for VerifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifierRegistry")
            .field("providers", &self.verifiers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl VerifierRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.register(verifier);
        self
    }

    pub fn register(&mut self, verifier: Arc<dyn TokenVerifier>) {
        self.verifiers.insert(verifier.provider(), verifier);
    }

    pub fn get(&self, provider: Provider) -> Result<&Arc<dyn TokenVerifier>> {
        self.verifiers
            .get(&provider)
            .ok_or(AuthError::UnsupportedProvider(provider))
    }

    pub fn is_registered(&self, provider: Provider) -> bool {
        self.verifiers.contains_key(&provider)
    }

    pub async fn verify(&self, token: &str, provider: Provider) -> Result<ExternalClaims> {
        let verifier = self.get(provider)?;
        let result = verifier.verify(token).await;
        if let Err(ref e) = result {
            tracing::debug!(provider = %provider, tag = e.tag(), "Token verification failed");
        }
        result
    }
}

/// Structural check of a compact JWS: three non-empty base64url segments,
/// header and payload decoding to JSON objects.
///
/// Runs before any key lookup so malformed input never reaches the network.
pub(crate) fn check_compact_structure(token: &str) -> Result<()> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(AuthError::InvalidTokenFormat(format!(
            "expected 3 segments, got {}",
            segments.len()
        )));
    }
    if segments.iter().any(|s| s.is_empty()) {
        return Err(AuthError::InvalidTokenFormat("empty segment".into()));
    }

    for (name, segment) in [("header", segments[0]), ("payload", segments[1])] {
        let bytes = URL_SAFE_NO_PAD
            .decode(segment)
            .map_err(|_| AuthError::InvalidTokenFormat(format!("{name} is not base64url")))?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|_| AuthError::InvalidTokenFormat(format!("{name} is not JSON")))?;
        if !value.is_object() {
            return Err(AuthError::InvalidTokenFormat(format!(
                "{name} is not a JSON object"
            )));
        }
    }

    URL_SAFE_NO_PAD
        .decode(segments[2])
        .map_err(|_| AuthError::InvalidTokenFormat("signature is not base64url".into()))?;

    Ok(())
}
