//! TLS configuration for the challenge and DiscoverHosts gRPC channels
//!
//! The challenge is a reverse call: the node listens and the controller dials. The
//! node trusts only the cluster CA for client certificates and the controller trusts
//! only the one-shot CA the node sent in its challenge offer.

use thiserror::Error;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};
use zeroize::Zeroizing;

/// mTLS configuration errors
#[derive(Debug, Error)]
pub enum MtlsError {
    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    CertificateParseError(String),

    /// The peer did not present a client certificate
    #[error("missing client certificate")]
    MissingCertificate,

    /// The peer certificate's subject is not the one expected
    #[error("unexpected peer subject {actual:?}, expected {expected:?}")]
    UnexpectedSubject {
        /// Subject CN presented by the peer
        actual: String,
        /// Subject CN required
        expected: String,
    },
}

/// Server side of a mutually authenticated channel
pub struct ServerMtlsConfig {
    /// Server certificate PEM
    pub server_cert_pem: String,
    /// Server private key PEM
    pub server_key_pem: Zeroizing<String>,
    /// CA bundle PEM that client certificates must chain to
    pub client_ca_pem: String,
}

impl ServerMtlsConfig {
    /// Create a new server mTLS config
    pub fn new(
        server_cert_pem: String,
        server_key_pem: Zeroizing<String>,
        client_ca_pem: String,
    ) -> Self {
        Self {
            server_cert_pem,
            server_key_pem,
            client_ca_pem,
        }
    }

    /// Build a tonic ServerTlsConfig that requires a verified client certificate
    pub fn to_tonic_config(&self) -> ServerTlsConfig {
        let identity = Identity::from_pem(&self.server_cert_pem, &*self.server_key_pem);
        ServerTlsConfig::new()
            .identity(identity)
            .client_ca_root(Certificate::from_pem(&self.client_ca_pem))
    }
}

/// Client side of a TLS channel, optionally presenting a certificate
pub struct ClientMtlsConfig {
    /// Client certificate and key PEM
    pub identity: Option<(String, Zeroizing<String>)>,
    /// CA PEM trusted for the server certificate
    pub server_ca_pem: String,
    /// Name the server certificate must carry
    pub server_domain: String,
}

impl ClientMtlsConfig {
    /// Mutual TLS: present `client_cert_pem` and trust only `server_ca_pem`
    pub fn new(
        client_cert_pem: String,
        client_key_pem: Zeroizing<String>,
        server_ca_pem: String,
        server_domain: String,
    ) -> Self {
        Self {
            identity: Some((client_cert_pem, client_key_pem)),
            server_ca_pem,
            server_domain,
        }
    }

    /// Server-authenticated TLS only; the caller authenticates per RPC
    pub fn server_only(server_ca_pem: String, server_domain: String) -> Self {
        Self {
            identity: None,
            server_ca_pem,
            server_domain,
        }
    }

    /// Build a tonic ClientTlsConfig
    pub fn to_tonic_config(&self) -> ClientTlsConfig {
        let mut config = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&self.server_ca_pem))
            .domain_name(&self.server_domain);
        if let Some((cert, key)) = &self.identity {
            config = config.identity(Identity::from_pem(cert, &**key));
        }
        config
    }
}

/// Subject CN of the verified client certificate on a gRPC request
pub fn peer_common_name<T>(request: &tonic::Request<T>) -> Result<String, MtlsError> {
    let certs = request.peer_certs().ok_or(MtlsError::MissingCertificate)?;
    let leaf = certs.first().ok_or(MtlsError::MissingCertificate)?;
    crate::cert::common_name_from_der(leaf.as_ref())
        .map_err(|e| MtlsError::CertificateParseError(e.to_string()))
}

/// Require the verified client certificate to carry `expected` as its CN
pub fn require_peer_common_name<T>(
    request: &tonic::Request<T>,
    expected: &str,
) -> Result<(), MtlsError> {
    let actual = peer_common_name(request)?;
    if actual != expected {
        return Err(MtlsError::UnexpectedSubject {
            actual,
            expected: expected.to_string(),
        });
    }
    Ok(())
}
