//! Deterministic cryptographic fixtures for testing
//!
//! Provides reproducible Ed25519 keypairs and their JWK form.
//! All fixtures are deterministic based on seed values.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Test fixture error type
#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),
}

/// Ed25519 keypair with a key id, able to sign tokens and publish its JWK.
#[derive(Debug, Clone)]
pub struct TestKeypair {
    kid: String,
    public_key_bytes: Vec<u8>,
    private_key_pkcs8: Vec<u8>,
}

impl TestKeypair {
    /// Deterministic keypair. The same seed always produces the same key.
    ///
    /// # Panics
    ///
    /// If ring rejects the derived seed (never for these fixtures).
    pub fn new(seed: u8, kid: &str) -> Self {
        Self::try_new(seed, kid).expect("Failed to create test keypair")
    }

    /// Fallible form of [`TestKeypair::new`].
    pub fn try_new(seed: u8, kid: &str) -> Result<Self, FixtureError> {
        let seed_bytes = seed_bytes(seed);

        let key_pair = Ed25519KeyPair::from_seed_unchecked(&seed_bytes)
            .map_err(|e| FixtureError::Crypto(format!("Failed to generate test keypair: {e:?}")))?;

        Ok(Self {
            kid: kid.to_string(),
            public_key_bytes: key_pair.public_key().as_ref().to_vec(),
            private_key_pkcs8: build_pkcs8_from_seed(&seed_bytes),
        })
    }

    /// Key id placed in token headers and the JWK.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Same key material under another key id.
    pub fn with_kid(&self, kid: &str) -> Self {
        Self {
            kid: kid.to_string(),
            ..self.clone()
        }
    }

    /// Sign `claims` as an EdDSA JWT carrying this key's `kid`.
    ///
    /// # Panics
    ///
    /// If `claims` cannot be serialized.
    pub fn sign<T: Serialize>(&self, claims: &T) -> String {
        let encoding_key = EncodingKey::from_ed_der(&self.private_key_pkcs8);
        let mut header = Header::new(Algorithm::EdDSA);
        header.typ = Some("JWT".to_string());
        header.kid = Some(self.kid.clone());

        encode(&header, claims, &encoding_key).expect("Failed to sign token")
    }

    /// Public key as an OKP JWK.
    pub fn jwk_json(&self) -> Value {
        json!({
            "kty": "OKP",
            "kid": self.kid,
            "crv": "Ed25519",
            "x": URL_SAFE_NO_PAD.encode(&self.public_key_bytes),
            "alg": "EdDSA",
            "use": "sig"
        })
    }
}

/// JWKS document publishing `keypairs`.
pub fn jwks_json(keypairs: &[&TestKeypair]) -> Value {
    json!({
        "keys": keypairs.iter().map(|k| k.jwk_json()).collect::<Vec<_>>()
    })
}

/// Assemble a token from raw parts without signing it.
///
/// For tokens a real signer refuses to produce (`alg: none`, mismatched
/// algorithms, garbage signatures).
pub fn unsigned_token(header: &Value, claims: &Value, signature: &str) -> String {
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
        signature
    )
}

fn seed_bytes(seed: u8) -> [u8; 32] {
    let mut seed_bytes = [0u8; 32];
    seed_bytes[0] = seed;
    // Fill rest with deterministic pattern
    for (i, byte) in seed_bytes.iter_mut().enumerate().skip(1) {
        *byte = seed.wrapping_mul(i as u8).wrapping_add(i as u8);
    }
    seed_bytes
}

/// Build PKCS#8 v1 document from Ed25519 seed
///
/// ring does not export PKCS#8 for keys made from a seed, so the document
/// is assembled by hand. Test-only.
fn build_pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
    let mut pkcs8 = Vec::with_capacity(48);

    // SEQUENCE, 46 bytes
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    // version INTEGER 0
    pkcs8.extend_from_slice(&[0x02, 0x01, 0x00]);
    // AlgorithmIdentifier SEQUENCE { OID 1.3.101.112 }
    pkcs8.extend_from_slice(&[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70]);
    // privateKey OCTET STRING { OCTET STRING (32-byte seed) }
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(seed);

    pkcs8
}
