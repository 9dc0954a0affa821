//! PKI errors

use thiserror::Error;

/// Errors raised while loading key material or issuing certificates
#[derive(Debug, Error)]
pub enum PkiError {
    /// Reading a keystore file failed
    #[error("IO error reading {path}: {source}")]
    Io {
        /// File that could not be read
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// PEM, DER or YAML could not be parsed
    #[error("parse error: {0}")]
    ParseError(String),

    /// The keystore has no keypair with this name
    #[error("unknown CA {0:?}")]
    UnknownCa(String),

    /// The submitted public key is not an RSA key
    #[error("unexpected key type: {0}")]
    UnsupportedKey(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Signing the certificate failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;
