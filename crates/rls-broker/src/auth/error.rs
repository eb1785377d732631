//! Authentication error types

use thiserror::Error;

use super::provider::Provider;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token format: {0}")]
    InvalidTokenFormat(String),

    #[error("key resolution failed: {0}")]
    KeyResolutionFailed(String),

    #[error("invalid signature")]
    SignatureInvalid,

    #[error("claim validation failed: {0}")]
    ClaimInvalid(String),

    #[error("missing tenant claim")]
    MissingTenantClaim,

    #[error("missing role claim")]
    MissingRoleClaim,

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("unsupported identity provider: {0}")]
    UnsupportedProvider(Provider),

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
}

impl AuthError {
    /// Stable taxonomy tag used in logs and metrics labels.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::InvalidTokenFormat(_) => "InvalidTokenFormat",
            Self::KeyResolutionFailed(_) => "KeyResolutionFailed",
            Self::SignatureInvalid => "SignatureInvalid",
            Self::ClaimInvalid(_) => "ClaimInvalid",
            Self::MissingTenantClaim => "MissingTenantClaim",
            Self::MissingRoleClaim => "MissingRoleClaim",
            Self::SigningFailed(_) => "SigningFailed",
            Self::UnsupportedProvider(_) => "UnsupportedProvider",
            Self::InvalidKeyMaterial(_) => "InvalidKeyMaterial",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::ClaimInvalid("token expired".into()),
            ErrorKind::ImmatureSignature => Self::ClaimInvalid("token not yet valid".into()),
            ErrorKind::InvalidIssuer => Self::ClaimInvalid("issuer mismatch".into()),
            ErrorKind::InvalidAudience => Self::ClaimInvalid("audience mismatch".into()),
            ErrorKind::InvalidSubject => Self::ClaimInvalid("subject mismatch".into()),
            ErrorKind::MissingRequiredClaim(claim) => {
                Self::ClaimInvalid(format!("missing required claim: {claim}"))
            }
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => Self::SignatureInvalid,
            ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidKeyFormat => Self::KeyResolutionFailed(err.to_string()),
            _ => Self::InvalidTokenFormat(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
