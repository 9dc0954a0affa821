//! CA keystore loaded from the controller's CA base path
//!
//! Layout on disk:
//!
//! ```text
//! <base>/<name>.crt        PEM certificate bundle, primary (current) certificate first
//! <base>/<name>.key        PEM private key of the primary certificate
//! <base>/keypair-ids.yaml  flat map of CA name to current keypair ID
//! ```
//!
//! The keystore is built once at startup and never mutated, so it is shared
//! between request handlers behind an `Arc` without locking.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs1KeyDer};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{PkiError, Result};

/// File holding the current keypair ID of every CA
pub const KEYPAIR_IDS_FILE: &str = "keypair-ids.yaml";

/// A CA certificate together with its private key
#[derive(Clone)]
pub struct Keypair {
    cert_pem: String,
    key_pem: Zeroizing<String>,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl Keypair {
    /// Build a keypair from PEM text, keeping only the first certificate of a bundle
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let blocks = ::pem::parse_many(cert_pem.as_bytes())
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
        let primary = blocks
            .into_iter()
            .find(|b| b.tag() == "CERTIFICATE")
            .ok_or_else(|| PkiError::ParseError("no CERTIFICATE block found".to_string()))?;

        let keypair = Self {
            cert_pem: ::pem::encode(&primary),
            key_pem: Zeroizing::new(key_pem.to_string()),
        };

        // Fail at load time rather than on the first signing request
        keypair.signing_key()?;
        Ok(keypair)
    }

    /// Generate a self-signed CA with the given common name
    ///
    /// nodeup uses this for the short-lived CA that backs its challenge listener.
    pub fn generate_ca(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now - ::time::Duration::hours(1);
        params.not_after = now + ::time::Duration::days(10 * 365);

        let key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let cert = params.self_signed(&key).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: Zeroizing::new(key.serialize_pem()),
        })
    }

    /// PEM of the primary certificate
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PEM of the private key
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Load the private key for signing.
    ///
    /// Accepts PKCS#8 (`PRIVATE KEY`) and PKCS#1 (`RSA PRIVATE KEY`) encodings.
    pub(crate) fn signing_key(&self) -> Result<KeyPair> {
        let block = ::pem::parse(self.key_pem.as_bytes())
            .map_err(|e| PkiError::ParseError(format!("failed to parse private key: {}", e)))?;

        match block.tag() {
            "PRIVATE KEY" => KeyPair::from_pem(&self.key_pem)
                .map_err(|e| PkiError::ParseError(format!("failed to load private key: {}", e))),
            "RSA PRIVATE KEY" => {
                let der = PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(block.contents().to_vec()));
                KeyPair::from_der_and_sign_algo(&der, &rcgen::PKCS_RSA_SHA256).map_err(|e| {
                    PkiError::ParseError(format!("failed to load RSA private key: {}", e))
                })
            }
            other => Err(PkiError::ParseError(format!(
                "unsupported private key encoding {:?}",
                other
            ))),
        }
    }
}

/// Immutable set of signing CAs indexed by name
#[derive(Debug, Clone, Default)]
pub struct Keystore {
    keypairs: HashMap<String, Keypair>,
    keypair_ids: BTreeMap<String, String>,
}

impl Keystore {
    /// Load the named CAs and the keypair-ID index from `base_path`
    pub fn load_from_directory<S: AsRef<str>>(
        base_path: impl AsRef<Path>,
        ca_names: &[S],
    ) -> Result<Self> {
        let base = base_path.as_ref();
        let mut keypairs = HashMap::new();

        for name in ca_names {
            let name = name.as_ref();
            let cert_pem = read_file(&base.join(format!("{}.crt", name)))?;
            let key_pem = Zeroizing::new(read_file(&base.join(format!("{}.key", name)))?);
            let keypair = Keypair::from_pem(&cert_pem, &key_pem)
                .map_err(|e| PkiError::ParseError(format!("keypair {:?}: {}", name, e)))?;
            debug!(ca = %name, "loaded CA keypair");
            keypairs.insert(name.to_string(), keypair);
        }

        let ids_yaml = read_file(&base.join(KEYPAIR_IDS_FILE))?;
        let keypair_ids: BTreeMap<String, String> = serde_yaml::from_str(&ids_yaml)
            .map_err(|e| PkiError::ParseError(format!("{}: {}", KEYPAIR_IDS_FILE, e)))?;

        info!(
            path = %base.display(),
            cas = keypairs.len(),
            "keystore loaded"
        );

        Ok(Self {
            keypairs,
            keypair_ids,
        })
    }

    /// Build a keystore from in-memory keypairs
    pub fn from_keypairs(
        keypairs: impl IntoIterator<Item = (String, Keypair)>,
        keypair_ids: BTreeMap<String, String>,
    ) -> Self {
        Self {
            keypairs: keypairs.into_iter().collect(),
            keypair_ids,
        }
    }

    /// Return the current keypair for `name`
    pub fn find_primary_keypair(&self, name: &str) -> Result<&Keypair> {
        self.keypairs
            .get(name)
            .ok_or_else(|| PkiError::UnknownCa(name.to_string()))
    }

    /// All keypair IDs read from `keypair-ids.yaml`
    pub fn keypair_ids(&self) -> &BTreeMap<String, String> {
        &self.keypair_ids
    }

    /// Current keypair ID of one CA; empty if the index has no entry
    pub fn keypair_id(&self, name: &str) -> &str {
        self.keypair_ids.get(name).map(String::as_str).unwrap_or("")
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| PkiError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_ca(dir: &Path, name: &str) -> Keypair {
        let ca = Keypair::generate_ca(name).expect("CA generation should succeed");
        std::fs::write(dir.join(format!("{}.crt", name)), ca.cert_pem()).expect("write crt");
        std::fs::write(dir.join(format!("{}.key", name)), ca.key_pem()).expect("write key");
        ca
    }

    #[test]
    fn loads_named_keypairs_and_ids() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let ca = write_ca(dir.path(), "kubernetes-ca");
        write_ca(dir.path(), "etcd-clients-ca-cilium");
        std::fs::write(
            dir.path().join(KEYPAIR_IDS_FILE),
            "kubernetes-ca: \"6982820025135291416230495506\"\netcd-clients-ca-cilium: \"42\"\n",
        )
        .expect("write ids");

        let ks = Keystore::load_from_directory(
            dir.path(),
            &["kubernetes-ca", "etcd-clients-ca-cilium"],
        )
        .expect("keystore should load");

        let kp = ks
            .find_primary_keypair("kubernetes-ca")
            .expect("CA should be present");
        assert_eq!(kp.cert_pem(), ca.cert_pem());
        assert_eq!(ks.keypair_id("kubernetes-ca"), "6982820025135291416230495506");
        assert_eq!(ks.keypair_id("etcd-clients-ca-cilium"), "42");
        assert_eq!(ks.keypair_id("missing"), "");
    }

    #[test]
    fn missing_key_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let ca = Keypair::generate_ca("kubernetes-ca").expect("CA generation should succeed");
        std::fs::write(dir.path().join("kubernetes-ca.crt"), ca.cert_pem()).expect("write crt");

        let err = Keystore::load_from_directory(dir.path(), &["kubernetes-ca"])
            .expect_err("load should fail without a key");
        assert!(matches!(err, PkiError::Io { .. }));
    }

    #[test]
    fn garbage_certificate_is_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let ca = Keypair::generate_ca("kubernetes-ca").expect("CA generation should succeed");
        std::fs::write(dir.path().join("kubernetes-ca.crt"), "not a cert").expect("write crt");
        std::fs::write(dir.path().join("kubernetes-ca.key"), ca.key_pem()).expect("write key");
        std::fs::write(dir.path().join(KEYPAIR_IDS_FILE), "{}").expect("write ids");

        let err = Keystore::load_from_directory(dir.path(), &["kubernetes-ca"])
            .expect_err("load should fail on garbage");
        assert!(matches!(err, PkiError::ParseError(_)));
    }

    #[test]
    fn bundle_keeps_primary_certificate_only() {
        let first = Keypair::generate_ca("first").expect("CA generation should succeed");
        let second = Keypair::generate_ca("second").expect("CA generation should succeed");
        let bundle = format!("{}{}", first.cert_pem(), second.cert_pem());

        let kp = Keypair::from_pem(&bundle, first.key_pem()).expect("bundle should load");
        let info = crate::CertificateInfo::from_pem(kp.cert_pem()).expect("cert should parse");
        assert_eq!(info.common_name, "first");
    }

    #[test]
    fn unknown_ca_lookup_fails() {
        let ks = Keystore::default();
        let err = ks
            .find_primary_keypair("kubernetes-ca")
            .expect_err("lookup should fail");
        assert!(matches!(err, PkiError::UnknownCa(name) if name == "kubernetes-ca"));
    }
}
