//! Identity provider identifiers

use std::fmt;
use std::str::FromStr;

/// External identity providers a deployment may name.
///
/// Naming a provider does not make it usable: only providers with a
/// registered [`TokenVerifier`](super::TokenVerifier) can verify tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Auth0,
    AwsCognito,
    Clerk,
    Kinde,
}

impl Provider {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth0 => "Auth0",
            Self::AwsCognito => "AWS Cognito",
            Self::Clerk => "Clerk",
            Self::Kinde => "Kinde",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '_'], "-").as_str() {
            "auth0" => Ok(Self::Auth0),
            "aws-cognito" | "cognito" => Ok(Self::AwsCognito),
            "clerk" => Ok(Self::Clerk),
            "kinde" => Ok(Self::Kinde),
            other => Err(format!("unknown identity provider: {other}")),
        }
    }
}
