//! Certificate inspection helpers

use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::*;

use crate::error::{PkiError, Result};

/// Fields of an X.509 certificate that the bootstrap protocol cares about
#[derive(Debug, Clone, Default)]
pub struct CertificateInfo {
    /// Subject common name
    pub common_name: String,
    /// Subject organizations
    pub organizations: Vec<String>,
    /// Start of validity (Unix seconds)
    pub not_before: i64,
    /// End of validity (Unix seconds)
    pub not_after: i64,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// IP subject alternative names, as strings
    pub ip_addresses: Vec<String>,
    /// Extended key usage includes serverAuth
    pub server_auth: bool,
    /// Extended key usage includes clientAuth
    pub client_auth: bool,
}

impl CertificateInfo {
    /// Parse from a PEM certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = crate::parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse from a DER certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let mut info = CertificateInfo {
            common_name: cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or("")
                .to_string(),
            organizations: cert
                .subject()
                .iter_organization()
                .filter_map(|o| o.as_str().ok())
                .map(str::to_string)
                .collect(),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            ..Default::default()
        };

        for ext in cert.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::SubjectAlternativeName(san) => {
                    for name in &san.general_names {
                        match name {
                            GeneralName::DNSName(dns) => info.dns_names.push(dns.to_string()),
                            GeneralName::IPAddress(bytes) => {
                                if let Some(ip) = ip_from_bytes(bytes) {
                                    info.ip_addresses.push(ip.to_string());
                                }
                            }
                            _ => {}
                        }
                    }
                }
                ParsedExtension::ExtendedKeyUsage(eku) => {
                    info.server_auth = eku.server_auth;
                    info.client_auth = eku.client_auth;
                }
                _ => {}
            }
        }

        Ok(info)
    }
}

/// Subject common name of a DER certificate
pub fn common_name_from_der(der: &[u8]) -> Result<String> {
    Ok(CertificateInfo::from_der(der)?.common_name)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<std::net::IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(std::net::IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(std::net::IpAddr::from),
        _ => None,
    }
}
