//! Token claim types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Audience can be a single string or array of strings
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn contains(&self, value: &str) -> bool {
        match self {
            Self::One(s) => s == value,
            Self::Many(v) => v.iter().any(|s| s == value),
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(v) => v.clone(),
        }
    }
}

/// Verified payload of an identity-provider token.
///
/// Provider-specific claims (tenant, role, namespaced variants) land in
/// `extra`; the claim mapper decides how to read them.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalClaims {
    pub sub: String,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<OneOrMany>,
    pub exp: i64,
    #[serde(default)]
    pub nbf: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub jti: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExternalClaims {
    /// Token id when the provider issued a numeric one.
    #[must_use]
    pub fn numeric_jti(&self) -> Option<i64> {
        self.jti.as_ref().and_then(Value::as_i64)
    }

    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }
}

/// Tenant and role resolved from external claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedIdentity {
    pub tenant_id: String,
    pub role: String,
}

/// Claims carried by the internal database credential.
///
/// The database extension requires `jti` to be an integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalClaims {
    pub sub: String,
    pub jti: i64,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub tenant_id: String,
    pub role: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_or_many_one() {
        let aud = OneOrMany::One("api".to_string());
        assert!(aud.contains("api"));
        assert!(!aud.contains("other"));
        assert_eq!(aud.to_vec(), vec!["api"]);
    }

    #[test]
    fn test_one_or_many_many() {
        let aud = OneOrMany::Many(vec!["api".to_string(), "web".to_string()]);
        assert!(aud.contains("api"));
        assert!(aud.contains("web"));
        assert!(!aud.contains("other"));
    }

    #[test]
    fn test_deserialize_external_claims() {
        let json = r#"{
            "sub": "auth0|user123",
            "iss": "https://tenant.auth0.com/",
            "aud": ["api", "https://tenant.auth0.com/userinfo"],
            "exp": 1700000000,
            "iat": 1699990000,
            "tenant_id": "t-1",
            "https://example.com/roles": "member"
        }"#;
        let claims: ExternalClaims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.sub, "auth0|user123");
        assert!(claims.aud.as_ref().unwrap().contains("api"));
        assert_eq!(claims.claim("tenant_id"), Some(&Value::from("t-1")));
        assert_eq!(
            claims.claim("https://example.com/roles"),
            Some(&Value::from("member"))
        );
        assert!(claims.nbf.is_none());
    }

    #[test]
    fn test_numeric_jti() {
        let claims: ExternalClaims =
            serde_json::from_str(r#"{"sub": "u", "exp": 1, "jti": 42}"#).unwrap();
        assert_eq!(claims.numeric_jti(), Some(42));

        let claims: ExternalClaims =
            serde_json::from_str(r#"{"sub": "u", "exp": 1, "jti": "abc-123"}"#).unwrap();
        assert_eq!(claims.numeric_jti(), None);

        // Numeric strings are not integers
        let claims: ExternalClaims =
            serde_json::from_str(r#"{"sub": "u", "exp": 1, "jti": "42"}"#).unwrap();
        assert_eq!(claims.numeric_jti(), None);

        let claims: ExternalClaims = serde_json::from_str(r#"{"sub": "u", "exp": 1}"#).unwrap();
        assert_eq!(claims.numeric_jti(), None);
    }

    #[test]
    fn test_internal_claims_serialize_shape() {
        let claims = InternalClaims {
            sub: "user-1".into(),
            jti: 1_700_000_000_123,
            iat: 1_700_000_000,
            nbf: 1_700_000_000,
            exp: 1_700_003_600,
            tenant_id: "t-1".into(),
            role: "member".into(),
        };
        let value = serde_json::to_value(&claims).unwrap();
        assert_eq!(value["jti"], 1_700_000_000_123_i64);
        assert_eq!(value["tenant_id"], "t-1");
        assert_eq!(value.as_object().unwrap().len(), 7);
    }
}
