//! Token exchange: external verification, claim mapping and internal signing
//!
//! Flow for a bearer token:
//!
//! 1. [`VerifierRegistry`] dispatches to the provider's [`TokenVerifier`]
//!    (only [`Auth0Verifier`] ships), which checks the token against the
//!    provider's cached key set.
//! 2. A [`ClaimMapper`] resolves tenant and role.
//! 3. [`InternalTokenSigner`] mints an Ed25519 credential the database
//!    verifies against the published [`PublicJwk`].

mod auth0;
mod claims;
mod error;
mod jwks;
mod keys;
mod mapper;
mod provider;
mod signer;
mod verifier;

pub use auth0::{Auth0Config, Auth0Verifier};
pub use claims::{ExternalClaims, InternalClaims, MappedIdentity, OneOrMany};
pub use error::{AuthError, Result};
pub use jwks::{HttpJwksFetcher, Jwk, JwkSet, JwksCache, JwksFetcher};
pub use keys::{KeyMaterial, PublicJwk};
pub use mapper::{ClaimMapper, NamespacedClaimMapper};
pub use provider::Provider;
pub use signer::{InternalToken, InternalTokenSigner, SignRequest};
pub use verifier::{TokenVerifier, VerifierRegistry};

#[cfg(test)]
pub(crate) use auth0::test_support;
#[cfg(test)]
pub(crate) use jwks::StaticJwksFetcher;
#[cfg(test)]
pub(crate) use keys::test_keys;
