//! Certificate issuance
//!
//! Every certificate the controller hands to a node comes from one of the fixed
//! [`CertProfile`]s. The profile decides the signer, subject, SANs and extended key
//! usage; the node only contributes its public key.

use std::time::Duration;

use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
    SubjectPublicKeyInfo,
};
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo as ParsedSpki;
use zeroize::Zeroizing;

use crate::error::{PkiError, Result};
use crate::keystore::{Keypair, Keystore};

/// Cluster CA name
pub const CLUSTER_CA: &str = "kubernetes-ca";

/// Dedicated CA for the cilium etcd client
pub const ETCD_CLIENTS_CA_CILIUM: &str = "etcd-clients-ca-cilium";

/// Group kubelets authenticate as
pub const NODES_GROUP: &str = "system:nodes";

/// Intended use of an issued certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertType {
    /// TLS client authentication
    Client,
    /// TLS server authentication
    Server,
}

/// Subject of an issued certificate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    /// Common name
    pub common_name: String,
    /// Organizations (groups, for Kubernetes client certs)
    pub organizations: Vec<String>,
}

impl Subject {
    /// Subject with only a common name
    pub fn cn(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organizations: Vec::new(),
        }
    }

    fn to_distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        for org in &self.organizations {
            dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
        }
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(self.common_name.clone()),
        );
        dn
    }
}

/// Everything needed to sign one certificate
#[derive(Debug, Clone)]
pub struct IssueCertRequest {
    /// Keystore name of the signing CA
    pub signer: String,
    /// Client or server certificate
    pub cert_type: CertType,
    /// Subject to embed
    pub subject: Subject,
    /// DNS names or IP addresses for the SAN extension
    pub alternate_names: Vec<String>,
    /// DER SubjectPublicKeyInfo of the key being certified
    pub public_key_der: Vec<u8>,
    /// Lifetime from now
    pub validity: Duration,
}

/// The certificate names a node may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertProfile {
    /// Kubelet client certificate
    Kubelet,
    /// Kubelet serving certificate
    KubeletServer,
    /// kube-proxy client certificate
    KubeProxy,
    /// kube-router client certificate
    KubeRouter,
    /// cilium's etcd client certificate
    EtcdClientCilium,
    /// Identity certificate for the machine itself
    MachineKey,
}

impl CertProfile {
    /// Every profile, in a stable order
    pub const ALL: [CertProfile; 6] = [
        CertProfile::Kubelet,
        CertProfile::KubeletServer,
        CertProfile::KubeProxy,
        CertProfile::KubeRouter,
        CertProfile::EtcdClientCilium,
        CertProfile::MachineKey,
    ];

    /// Look up a profile by its wire name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    /// Wire name used as the key in bootstrap requests
    pub fn name(&self) -> &'static str {
        match self {
            CertProfile::Kubelet => "kubelet",
            CertProfile::KubeletServer => "kubelet-server",
            CertProfile::KubeProxy => "kube-proxy",
            CertProfile::KubeRouter => "kube-router",
            CertProfile::EtcdClientCilium => "etcd-client-cilium",
            CertProfile::MachineKey => "machine-key",
        }
    }

    /// Keystore name of the CA that signs this profile
    pub fn signer(&self) -> &'static str {
        match self {
            CertProfile::EtcdClientCilium => ETCD_CLIENTS_CA_CILIUM,
            _ => CLUSTER_CA,
        }
    }

    /// Build the issue request for `node_name`
    ///
    /// `certificate_names` are the addresses the cloud reported for the instance;
    /// only the kubelet serving certificate embeds them.
    pub fn request(
        &self,
        node_name: &str,
        certificate_names: &[String],
        public_key_der: Vec<u8>,
        validity: Duration,
    ) -> IssueCertRequest {
        let mut alternate_names = Vec::new();
        let mut cert_type = CertType::Client;

        let subject = match self {
            CertProfile::Kubelet => Subject {
                common_name: format!("system:node:{}", node_name),
                organizations: vec![NODES_GROUP.to_string()],
            },
            CertProfile::KubeletServer => {
                cert_type = CertType::Server;
                alternate_names.push(node_name.to_string());
                for name in certificate_names {
                    if !alternate_names.contains(name) {
                        alternate_names.push(name.clone());
                    }
                }
                Subject::cn(node_name)
            }
            CertProfile::KubeProxy => Subject::cn("system:kube-proxy"),
            CertProfile::KubeRouter => Subject::cn("system:kube-router"),
            CertProfile::EtcdClientCilium => Subject::cn("cilium"),
            CertProfile::MachineKey => Subject {
                common_name: format!("kops:machine:{}", node_name),
                organizations: vec!["kops:machines".to_string()],
            },
        };

        IssueCertRequest {
            signer: self.signer().to_string(),
            cert_type,
            subject,
            alternate_names,
            public_key_der,
            validity,
        }
    }
}

/// Lifetime of a node certificate: 455 days plus up to 30 days of per-node jitter.
///
/// The jitter is derived from the node identity so nodes that boot together do not
/// all expire together.
pub fn node_cert_validity(node_identity: &str) -> Duration {
    let jitter_hours = u64::from(fnv32(node_identity.as_bytes()) % (30 * 24));
    Duration::from_secs((455 * 24 + jitter_hours) * 3600)
}

/// 32-bit FNV-1
fn fnv32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 2_166_136_261;
    const PRIME: u32 = 16_777_619;
    data.iter().fold(OFFSET_BASIS, |hash, b| {
        hash.wrapping_mul(PRIME) ^ u32::from(*b)
    })
}

/// Decode a node-submitted public key and require it to be RSA.
///
/// Accepts `PUBLIC KEY` and `RSA PUBLIC KEY` PEM blocks; both carry a DER
/// SubjectPublicKeyInfo. Returns the SPKI DER.
pub fn parse_rsa_public_key_pem(pem_data: &str) -> Result<Vec<u8>> {
    let block = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse public key PEM: {}", e)))?;
    if block.tag() != "RSA PUBLIC KEY" && block.tag() != "PUBLIC KEY" {
        return Err(PkiError::UnsupportedKey(format!("PEM block {:?}", block.tag())));
    }

    let der = block.contents().to_vec();
    let (_, spki) = ParsedSpki::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("parsing key: {}", e)))?;
    match spki.parsed() {
        Ok(PublicKey::RSA(_)) => Ok(der),
        Ok(_) => Err(PkiError::UnsupportedKey("expected an RSA key".to_string())),
        Err(e) => Err(PkiError::ParseError(format!("parsing key: {}", e))),
    }
}

/// Sign `req` with the CA named by `req.signer`, returning the certificate PEM
pub fn issue_cert(keystore: &Keystore, req: &IssueCertRequest) -> Result<String> {
    let signer = keystore.find_primary_keypair(&req.signer)?;
    let params = build_params(req.cert_type, &req.subject, &req.alternate_names, req.validity)?;

    let public_key = SubjectPublicKeyInfo::from_der(&req.public_key_der)
        .map_err(|e| PkiError::ParseError(format!("invalid public key: {}", e)))?;

    let ca_key = signer.signing_key()?;
    let issuer = Issuer::from_ca_cert_pem(signer.cert_pem(), &ca_key)
        .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

    let cert = params.signed_by(&public_key, &issuer).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
    })?;
    Ok(cert.pem())
}

/// Generate a fresh ECDSA key and a certificate for it signed by `signer`.
///
/// Returns `(cert_pem, key_pem)`. Used for the controller's challenge client
/// certificate and for nodeup's challenge listener.
pub fn issue_with_new_key(
    signer: &Keypair,
    cert_type: CertType,
    subject: &Subject,
    alternate_names: &[String],
    validity: Duration,
) -> Result<(String, Zeroizing<String>)> {
    let params = build_params(cert_type, subject, alternate_names, validity)?;

    let key = KeyPair::generate()
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate key: {}", e)))?;

    let ca_key = signer.signing_key()?;
    let issuer = Issuer::from_ca_cert_pem(signer.cert_pem(), &ca_key)
        .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

    let cert = params.signed_by(&key, &issuer).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
    })?;
    Ok((cert.pem(), Zeroizing::new(key.serialize_pem())))
}

fn build_params(
    cert_type: CertType,
    subject: &Subject,
    alternate_names: &[String],
    validity: Duration,
) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    params.distinguished_name = subject.to_distinguished_name();
    params.is_ca = IsCa::ExplicitNoCa;
    params.serial_number = Some(random_serial()?);
    params.use_authority_key_identifier_extension = true;

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = match cert_type {
        CertType::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
        CertType::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
    };

    let now = ::time::OffsetDateTime::now_utc();
    let validity = ::time::Duration::try_from(validity).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("invalid validity: {}", e))
    })?;
    params.not_before = now - ::time::Duration::hours(1);
    params.not_after = now + validity;

    params.subject_alt_names = alternate_names
        .iter()
        .map(|name| {
            if let Ok(ip) = name.parse::<std::net::IpAddr>() {
                Ok(SanType::IpAddress(ip))
            } else {
                Ia5String::try_from(name.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        PkiError::CertificateGenerationFailed(format!(
                            "invalid DNS name '{}': {}",
                            name, e
                        ))
                    })
            }
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(params)
}

fn random_serial() -> Result<SerialNumber> {
    let mut bytes = [0u8; 16];
    aws_lc_rs::rand::fill(&mut bytes)
        .map_err(|_| PkiError::KeyGenerationFailed("failed to generate serial".to_string()))?;
    // Keep the serial positive
    bytes[0] &= 0x7f;
    Ok(SerialNumber::from(bytes.to_vec()))
}
