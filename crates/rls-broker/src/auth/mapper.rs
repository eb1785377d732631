//! Tenant and role extraction from verified provider claims

use std::fmt;

use serde_json::Value;

use super::claims::{ExternalClaims, MappedIdentity};
use super::error::{AuthError, Result};

/// Pure mapping from verified provider claims to tenant and role.
pub trait ClaimMapper: Send + Sync + fmt::Debug {
    fn map(&self, claims: &ExternalClaims) -> Result<MappedIdentity>;
}

/// Reads `tenant_id`/`role`, falling back to `{namespace}/tenant_id` and
/// `{namespace}/roles` as set by provider login actions.
#[derive(Clone)]
pub struct NamespacedClaimMapper {
    tenant_claim: String,
    role_claim: String,
    #[cfg(any(test, feature = "insecure-test-fallback"))]
    fallback: Option<MappedIdentity>,
}

impl fmt::Debug for NamespacedClaimMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("NamespacedClaimMapper");
        d.field("tenant_claim", &self.tenant_claim)
            .field("role_claim", &self.role_claim);
        #[cfg(any(test, feature = "insecure-test-fallback"))]
        d.field("fallback", &self.fallback);
        d.finish()
    }
}

impl NamespacedClaimMapper {
    pub fn new(namespace: &str) -> Self {
        let namespace = namespace.trim_end_matches('/');
        Self {
            tenant_claim: format!("{namespace}/tenant_id"),
            role_claim: format!("{namespace}/roles"),
            #[cfg(any(test, feature = "insecure-test-fallback"))]
            fallback: None,
        }
    }

    /// Default tenant and role for tokens carrying neither claim.
    #[cfg(any(test, feature = "insecure-test-fallback"))]
    #[must_use]
    pub fn with_insecure_fallback(mut self, tenant_id: &str, role: &str) -> Self {
        tracing::warn!("Claim mapper fallback identity enabled; never use in production");
        self.fallback = Some(MappedIdentity {
            tenant_id: tenant_id.to_string(),
            role: role.to_string(),
        });
        self
    }

    fn resolve(&self, claims: &ExternalClaims, direct: &str, namespaced: &str) -> Option<String> {
        claims
            .claim(direct)
            .and_then(claim_text)
            .or_else(|| claims.claim(namespaced).and_then(claim_text))
    }

    #[cfg(any(test, feature = "insecure-test-fallback"))]
    fn fallback_for(&self, tenant: bool) -> Option<String> {
        self.fallback.as_ref().map(|f| {
            if tenant {
                f.tenant_id.clone()
            } else {
                f.role.clone()
            }
        })
    }

    #[cfg(not(any(test, feature = "insecure-test-fallback")))]
    #[allow(clippy::unused_self)]
    const fn fallback_for(&self, _tenant: bool) -> Option<String> {
        None
    }
}

impl ClaimMapper for NamespacedClaimMapper {
    fn map(&self, claims: &ExternalClaims) -> Result<MappedIdentity> {
        let tenant_id = self
            .resolve(claims, "tenant_id", &self.tenant_claim)
            .or_else(|| self.fallback_for(true))
            .ok_or(AuthError::MissingTenantClaim)?;
        let role = self
            .resolve(claims, "role", &self.role_claim)
            .or_else(|| self.fallback_for(false))
            .ok_or(AuthError::MissingRoleClaim)?;

        Ok(MappedIdentity { tenant_id, role })
    }
}

/// Non-empty string, or the first non-empty string of an array.
fn claim_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => items
            .iter()
            .find_map(|v| v.as_str().filter(|s| !s.is_empty()))
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const NS: &str = "https://example.com";

    fn claims(extra: Value) -> ExternalClaims {
        let mut value = json!({"sub": "user-1", "exp": 1});
        value
            .as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_direct_claims() {
        let mapper = NamespacedClaimMapper::new(NS);
        let identity = mapper
            .map(&claims(json!({"tenant_id": "t-1", "role": "member"})))
            .unwrap();
        assert_eq!(identity.tenant_id, "t-1");
        assert_eq!(identity.role, "member");
    }

    #[test]
    fn test_namespaced_fallback() {
        let mapper = NamespacedClaimMapper::new("https://example.com/");
        let identity = mapper
            .map(&claims(json!({
                "https://example.com/tenant_id": "t-2",
                "https://example.com/roles": ["admin", "member"],
            })))
            .unwrap();
        assert_eq!(identity.tenant_id, "t-2");
        assert_eq!(identity.role, "admin");
    }

    #[test]
    fn test_direct_claim_wins_over_namespaced() {
        let mapper = NamespacedClaimMapper::new(NS);
        let identity = mapper
            .map(&claims(json!({
                "tenant_id": "direct",
                "https://example.com/tenant_id": "namespaced",
                "role": "member",
            })))
            .unwrap();
        assert_eq!(identity.tenant_id, "direct");
    }

    #[test]
    fn test_empty_direct_claim_falls_through() {
        let mapper = NamespacedClaimMapper::new(NS);
        let identity = mapper
            .map(&claims(json!({
                "tenant_id": "",
                "https://example.com/tenant_id": "t-3",
                "role": "member",
            })))
            .unwrap();
        assert_eq!(identity.tenant_id, "t-3");
    }

    #[test]
    fn test_missing_tenant() {
        let mapper = NamespacedClaimMapper::new(NS);
        let err = mapper.map(&claims(json!({"role": "member"}))).unwrap_err();
        assert!(matches!(err, AuthError::MissingTenantClaim));
    }

    #[test]
    fn test_missing_role() {
        let mapper = NamespacedClaimMapper::new(NS);
        let err = mapper
            .map(&claims(json!({"tenant_id": "t-1", "role": []})))
            .unwrap_err();
        assert!(matches!(err, AuthError::MissingRoleClaim));
    }

    #[test]
    fn test_non_string_claims_ignored() {
        let mapper = NamespacedClaimMapper::new(NS);
        let err = mapper
            .map(&claims(json!({"tenant_id": 42, "role": "member"})))
            .unwrap_err();
        assert!(matches!(err, AuthError::MissingTenantClaim));
    }

    #[test]
    fn test_insecure_fallback_only_fills_gaps() {
        let mapper = NamespacedClaimMapper::new(NS).with_insecure_fallback("t-test", "tester");
        let identity = mapper.map(&claims(json!({"role": "member"}))).unwrap();
        assert_eq!(identity.tenant_id, "t-test");
        assert_eq!(identity.role, "member");
    }
}
