//! Token signed by an enrolled machine key

use std::path::Path;

use async_trait::async_trait;
use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::Authenticator;
use crate::error::AuthError;
use crate::model::{AuthToken, AuthTokenData};
use crate::{request_hash, scheme};

/// Signs `{timestamp, audience, requestHash, keyID}` with an ECDSA P-256 key
pub struct PkiAuthenticator {
    key_id: String,
    key: EcdsaKeyPair,
    rng: SystemRandom,
}

impl std::fmt::Debug for PkiAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkiAuthenticator")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl PkiAuthenticator {
    /// Build from a PKCS#8 PEM private key registered under `key_id`
    pub fn from_pem(key_id: impl Into<String>, key_pem: &str) -> Result<Self, AuthError> {
        let der = kops_pki::parse_pem(key_pem).map_err(|e| AuthError::Sign(e.to_string()))?;
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &der)
            .map_err(|e| AuthError::Sign(format!("loading machine key: {}", e)))?;
        Ok(Self {
            key_id: key_id.into(),
            key,
            rng: SystemRandom::new(),
        })
    }

    /// Load the private key from `path`
    pub fn load(key_id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let pem = zeroize::Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            AuthError::Sign(format!("reading machine key {}: {}", path.display(), e))
        })?);
        Self::from_pem(key_id, &pem)
    }

    fn sign(&self, data: &AuthTokenData) -> Result<AuthToken, AuthError> {
        let data = serde_json::to_vec(data)
            .map_err(|e| AuthError::Sign(format!("encoding token data: {}", e)))?;
        let signature = self
            .key
            .sign(&self.rng, &data)
            .map_err(|e| AuthError::Sign(format!("signing token: {}", e)))?;
        Ok(AuthToken {
            data,
            signature: signature.as_ref().to_vec(),
        })
    }
}

#[async_trait]
impl Authenticator for PkiAuthenticator {
    async fn create_token(&self, body: &[u8]) -> Result<String, AuthError> {
        let data = AuthTokenData {
            timestamp: chrono::Utc::now().timestamp(),
            audience: kops_common::AUDIENCE_NODE_AUTHENTICATION.to_string(),
            request_hash: request_hash(body),
            key_id: self.key_id.clone(),
            instance: String::new(),
        };
        let token = self.sign(&data)?;
        let json = serde_json::to_vec(&token)
            .map_err(|e| AuthError::Sign(format!("encoding token: {}", e)))?;
        Ok(format!("{}{}", scheme::PKI, STANDARD.encode(json)))
    }
}
