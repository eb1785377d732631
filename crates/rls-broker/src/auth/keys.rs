//! Ed25519 key material for minting internal database credentials
//!
//! The private half is only reachable through [`KeyMaterial::encoding_key`],
//! which is crate-private and used solely by the internal token signer.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::SigningKey;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use jsonwebtoken::{DecodingKey, EncodingKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::error::{AuthError, Result};

const ED25519_KEY_LEN: usize = 32;

/// Public key descriptor published to the database engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub alg: String,
}

impl PublicJwk {
    fn ed25519(public_key: &[u8; ED25519_KEY_LEN]) -> Self {
        Self {
            kty: "OKP".to_string(),
            crv: "Ed25519".to_string(),
            x: URL_SAFE_NO_PAD.encode(public_key),
            key_use: "sig".to_string(),
            alg: "EdDSA".to_string(),
        }
    }

    /// Decoding key for verifying tokens against this descriptor.
    pub fn decoding_key(&self) -> Result<DecodingKey> {
        DecodingKey::from_ed_components(&self.x)
            .map_err(|e| AuthError::InvalidKeyMaterial(format!("invalid JWK: {e}")))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Process-lifetime signing key pair.
pub struct KeyMaterial {
    encoding_key: EncodingKey,
    public_key: [u8; ED25519_KEY_LEN],
    jwk: PublicJwk,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("jwk", &self.jwk)
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Load the key pair from hex-encoded 32-byte private seed and public key.
    ///
    /// The supplied public key must be the one derived from the seed.
    pub fn from_hex(signing_key_hex: &str, public_key_hex: &str) -> Result<Self> {
        let seed = decode_key_hex(signing_key_hex, "signing key")?;
        let public = decode_key_hex(public_key_hex, "public key")?;

        let material = Self::from_seed(&seed)?;
        if material.public_key != *public {
            return Err(AuthError::InvalidKeyMaterial(
                "public key does not match signing key".into(),
            ));
        }
        Ok(material)
    }

    pub fn from_seed(seed: &[u8; ED25519_KEY_LEN]) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(seed);
        let public_key = signing_key.verifying_key().to_bytes();

        let der = signing_key
            .to_pkcs8_der()
            .map_err(|e| AuthError::InvalidKeyMaterial(format!("PKCS#8 encoding failed: {e}")))?;
        let encoding_key = EncodingKey::from_ed_der(der.as_bytes());

        Ok(Self {
            encoding_key,
            public_key,
            jwk: PublicJwk::ed25519(&public_key),
        })
    }

    #[must_use]
    pub const fn jwk(&self) -> &PublicJwk {
        &self.jwk
    }

    #[must_use]
    pub const fn public_key(&self) -> &[u8; ED25519_KEY_LEN] {
        &self.public_key
    }

    #[must_use]
    pub fn decoding_key(&self) -> DecodingKey {
        DecodingKey::from_ed_der(&self.public_key)
    }

    pub(crate) const fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }
}

fn decode_key_hex(input: &str, what: &str) -> Result<Zeroizing<[u8; ED25519_KEY_LEN]>> {
    let bytes = Zeroizing::new(
        hex::decode(input.trim())
            .map_err(|_| AuthError::InvalidKeyMaterial(format!("{what} must be valid hex")))?,
    );
    if bytes.len() != ED25519_KEY_LEN {
        return Err(AuthError::InvalidKeyMaterial(format!(
            "{what} must be {ED25519_KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; ED25519_KEY_LEN]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
pub(crate) mod test_keys {
    use super::*;

    pub const SEED: [u8; 32] = [7u8; 32];

    pub fn key_material() -> KeyMaterial {
        KeyMaterial::from_seed(&SEED).unwrap()
    }

    pub fn hex_pair(seed: &[u8; 32]) -> (String, String) {
        let signing_key = SigningKey::from_bytes(seed);
        (
            hex::encode(seed),
            hex::encode(signing_key.verifying_key().to_bytes()),
        )
    }
}
