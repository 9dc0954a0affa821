//! Node-side private key generation

use rcgen::{KeyPair, RsaKeySize, PKCS_RSA_SHA256};
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{PkiError, Result};

/// Environment variable selecting the RSA modulus size for node keys
pub const RSA_KEY_SIZE_ENV: &str = "KOPS_RSA_PRIVATE_KEY_SIZE";

/// Modulus size used when the environment does not say otherwise
pub const DEFAULT_RSA_KEY_SIZE: usize = 2048;

/// A private key generated on the node, with its public half
pub struct NodeKey {
    private_key_pem: Zeroizing<String>,
    public_key_pem: String,
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKey")
            .field("public_key_pem", &self.public_key_pem)
            .finish_non_exhaustive()
    }
}

impl NodeKey {
    /// PKCS#8 PEM of the private key
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// SubjectPublicKeyInfo PEM, the form sent in bootstrap requests
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }
}

/// Generate an RSA key of `bits` (2048, 3072 or 4096)
pub fn generate_rsa_key(bits: usize) -> Result<NodeKey> {
    let size = match bits {
        2048 => RsaKeySize::_2048,
        3072 => RsaKeySize::_3072,
        4096 => RsaKeySize::_4096,
        other => {
            return Err(PkiError::KeyGenerationFailed(format!(
                "unsupported RSA key size {}",
                other
            )))
        }
    };

    let key = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, size)
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate RSA key: {}", e)))?;

    Ok(NodeKey {
        private_key_pem: Zeroizing::new(key.serialize_pem()),
        public_key_pem: key.public_key_pem(),
    })
}

/// RSA key size from `KOPS_RSA_PRIVATE_KEY_SIZE`, falling back to 2048
pub fn rsa_key_size_from_env() -> usize {
    parse_key_size(std::env::var(RSA_KEY_SIZE_ENV).ok().as_deref())
}

fn parse_key_size(value: Option<&str>) -> usize {
    match value.map(str::trim) {
        None | Some("") => DEFAULT_RSA_KEY_SIZE,
        Some(raw) => match raw.parse::<usize>() {
            Ok(bits) => bits,
            Err(e) => {
                warn!(value = %raw, error = %e, "ignoring invalid {}", RSA_KEY_SIZE_ENV);
                DEFAULT_RSA_KEY_SIZE
            }
        },
    }
}
