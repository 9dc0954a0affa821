//! PKI for the kops bootstrap protocol
//!
//! The controller loads its signing CAs from disk ([`Keystore`]) and issues short-lived
//! leaf certificates for public keys that nodes generate locally ([`issue_cert`]). A
//! node never sends a private key: it sends one public key per certificate name and
//! receives the signed certificate back.
//!
//! Certificate profiles (subject, SANs, signer, key usage) are fixed by
//! [`CertProfile`]; the controller only chooses which names are enabled.

pub mod cert;
pub mod error;
pub mod issue;
pub mod keys;
pub mod keystore;
pub mod mtls;

pub use cert::CertificateInfo;
pub use error::{PkiError, Result};
pub use issue::{
    issue_cert, issue_with_new_key, node_cert_validity, parse_rsa_public_key_pem, CertProfile, CertType,
    IssueCertRequest, Subject, CLUSTER_CA,
};
pub use keys::{generate_rsa_key, rsa_key_size_from_env, NodeKey};
pub use keystore::{Keypair, Keystore};
pub use mtls::{
    peer_common_name, require_peer_common_name, ClientMtlsConfig, MtlsError, ServerMtlsConfig,
};

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let block = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(block.contents().to_vec())
}
