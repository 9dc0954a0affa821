//! Verifier for `x-pki-tpm` tokens signed by an enrolled machine key
//!
//! Machines are enrolled out of band by creating a `Host` object in `kops-system`
//! whose name is the key ID and whose spec carries the SPKI PEM public key and the
//! instance group. The challenge is sent back to the address the request came from.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_lc_rs::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_ASN1};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Api;
#[cfg(test)]
use mockall::automock;
use tracing::debug;
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

use super::{challenge_endpoint, check_token_claims, RequestContext, Verifier};
use crate::error::VerifyError;
use crate::model::{AuthToken, AuthTokenData, VerifyResult};
use crate::scheme;

/// Registered public key of a machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    /// SPKI PEM of the machine's ECDSA P-256 key
    pub public_key_pem: String,
    /// Instance group the machine belongs to
    pub instance_group: String,
}

/// Lookup of enrolled machine keys
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostKeyStore: Send + Sync {
    /// Key registered under `key_id`, if any
    async fn get(&self, key_id: &str) -> Result<Option<HostKey>, VerifyError>;
}

/// [`HostKeyStore`] backed by `Host` custom resources
pub struct KubeHostKeyStore {
    api: Api<DynamicObject>,
}

impl KubeHostKeyStore {
    /// Store reading `hosts.kops.k8s.io` in the kops-system namespace
    pub fn new(client: kube::Client) -> Self {
        let gvk = GroupVersionKind::gvk("kops.k8s.io", "v1alpha2", "Host");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "hosts");
        Self {
            api: Api::namespaced_with(client, kops_common::KOPS_SYSTEM_NAMESPACE, &resource),
        }
    }
}

#[async_trait]
impl HostKeyStore for KubeHostKeyStore {
    async fn get(&self, key_id: &str) -> Result<Option<HostKey>, VerifyError> {
        let host = self
            .api
            .get_opt(key_id)
            .await
            .map_err(|e| VerifyError::CloudApi(format!("getting host {:?}: {}", key_id, e)))?;
        let Some(host) = host else {
            return Ok(None);
        };

        let spec = &host.data["spec"];
        let public_key_pem = spec["publicKey"].as_str().unwrap_or_default().to_string();
        if public_key_pem.is_empty() {
            return Err(VerifyError::UnknownInstance(format!(
                "host {:?} has no public key",
                key_id
            )));
        }
        Ok(Some(HostKey {
            public_key_pem,
            instance_group: spec["instanceGroup"].as_str().unwrap_or_default().to_string(),
        }))
    }
}

/// Verifies tokens signed by keys registered in a [`HostKeyStore`]
pub struct PkiVerifier {
    store: Arc<dyn HostKeyStore>,
    max_time_skew: Duration,
}

impl PkiVerifier {
    /// Verifier over `store` accepting timestamps within `max_time_skew`
    pub fn new(store: Arc<dyn HostKeyStore>, max_time_skew: Duration) -> Self {
        Self {
            store,
            max_time_skew,
        }
    }
}

#[async_trait]
impl Verifier for PkiVerifier {
    async fn verify_token(
        &self,
        ctx: &RequestContext,
        token: &str,
        body: &[u8],
    ) -> Result<VerifyResult, VerifyError> {
        let encoded = token
            .strip_prefix(scheme::PKI)
            .ok_or(VerifyError::WrongScheme)?;

        let json = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VerifyError::BadSignature(format!("decoding token: {}", e)))?;
        let token: AuthToken = serde_json::from_slice(&json)
            .map_err(|e| VerifyError::BadSignature(format!("unmarshalling token: {}", e)))?;
        let data: AuthTokenData = serde_json::from_slice(&token.data)
            .map_err(|e| VerifyError::BadSignature(format!("unmarshalling token data: {}", e)))?;

        check_token_claims(&data, body, self.max_time_skew, chrono::Utc::now().timestamp())?;

        if data.key_id.is_empty() {
            return Err(VerifyError::BadSignature("token has no key ID".to_string()));
        }
        let host = self.store.get(&data.key_id).await?.ok_or_else(|| {
            VerifyError::UnknownInstance(format!("no host registered for key {:?}", data.key_id))
        })?;

        verify_signature(&host.public_key_pem, &token.data, &token.signature)?;

        let peer = ctx.remote_addr.ok_or_else(|| {
            VerifyError::BadSignature("request has no peer address".to_string())
        })?;
        let ip = peer.ip().to_string();

        debug!(key = %data.key_id, peer = %ip, "verified machine key");
        Ok(VerifyResult {
            node_name: data.key_id,
            instance_group_name: host.instance_group,
            certificate_names: vec![ip.clone()],
            challenge_endpoint: challenge_endpoint(&ip),
        })
    }
}

fn verify_signature(public_key_pem: &str, data: &[u8], signature: &[u8]) -> Result<(), VerifyError> {
    let der = kops_pki::parse_pem(public_key_pem)
        .map_err(|e| VerifyError::BadSignature(format!("registered key: {}", e)))?;
    let (_, spki) = SubjectPublicKeyInfo::from_der(&der)
        .map_err(|e| VerifyError::BadSignature(format!("registered key: {}", e)))?;

    UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, spki.subject_public_key.data.as_ref())
        .verify(data, signature)
        .map_err(|_| VerifyError::BadSignature("signature verification failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authn::{Authenticator, PkiAuthenticator};
    use crate::verify::DEFAULT_MAX_TIME_SKEW;
    use aws_lc_rs::rand::SystemRandom;
    use aws_lc_rs::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
    use std::net::SocketAddr;

    fn peer() -> RequestContext {
        RequestContext {
            remote_addr: Some("10.0.16.4:51234".parse::<SocketAddr>().expect("valid addr")),
        }
    }

    fn enrolled(key: &rcgen::KeyPair) -> Arc<dyn HostKeyStore> {
        let host = HostKey {
            public_key_pem: key.public_key_pem(),
            instance_group: "nodes-a".to_string(),
        };
        let mut store = MockHostKeyStore::new();
        store
            .expect_get()
            .returning(move |key_id| Ok((key_id == "node-a").then(|| host.clone())));
        Arc::new(store)
    }

    #[tokio::test]
    async fn signed_token_is_verified() {
        let key = rcgen::KeyPair::generate().expect("key generation should succeed");
        let auth = PkiAuthenticator::from_pem("node-a", &key.serialize_pem())
            .expect("authenticator should build");
        let token = auth
            .create_token(b"body")
            .await
            .expect("token creation should succeed");

        let verifier = PkiVerifier::new(enrolled(&key), DEFAULT_MAX_TIME_SKEW);
        let result = verifier
            .verify_token(&peer(), &token, b"body")
            .await
            .expect("verification should succeed");

        assert_eq!(result.node_name, "node-a");
        assert_eq!(result.instance_group_name, "nodes-a");
        assert_eq!(result.certificate_names, vec!["10.0.16.4"]);
        assert_eq!(result.challenge_endpoint, "10.0.16.4:3989");
    }

    #[tokio::test]
    async fn token_for_other_body_is_rejected() {
        let key = rcgen::KeyPair::generate().expect("key generation should succeed");
        let auth = PkiAuthenticator::from_pem("node-a", &key.serialize_pem())
            .expect("authenticator should build");
        let token = auth
            .create_token(b"body")
            .await
            .expect("token creation should succeed");

        let verifier = PkiVerifier::new(enrolled(&key), DEFAULT_MAX_TIME_SKEW);
        let err = verifier
            .verify_token(&peer(), &token, b"other body")
            .await
            .expect_err("hash mismatch should fail");
        assert!(matches!(err, VerifyError::BadSignature(_)));
    }

    #[tokio::test]
    async fn token_signed_by_other_key_is_rejected() {
        let registered = rcgen::KeyPair::generate().expect("key generation should succeed");
        let impostor = rcgen::KeyPair::generate().expect("key generation should succeed");
        let auth = PkiAuthenticator::from_pem("node-a", &impostor.serialize_pem())
            .expect("authenticator should build");
        let token = auth
            .create_token(b"body")
            .await
            .expect("token creation should succeed");

        let verifier = PkiVerifier::new(enrolled(&registered), DEFAULT_MAX_TIME_SKEW);
        let err = verifier
            .verify_token(&peer(), &token, b"body")
            .await
            .expect_err("impostor signature should fail");
        assert!(matches!(err, VerifyError::BadSignature(msg) if msg.contains("signature")));
    }

    #[tokio::test]
    async fn unenrolled_key_is_unknown_instance() {
        let key = rcgen::KeyPair::generate().expect("key generation should succeed");
        let auth = PkiAuthenticator::from_pem("node-z", &key.serialize_pem())
            .expect("authenticator should build");
        let token = auth
            .create_token(b"")
            .await
            .expect("token creation should succeed");

        let verifier = PkiVerifier::new(enrolled(&key), DEFAULT_MAX_TIME_SKEW);
        let err = verifier
            .verify_token(&peer(), &token, b"")
            .await
            .expect_err("unregistered key should fail");
        assert!(matches!(err, VerifyError::UnknownInstance(_)));
    }

    #[tokio::test]
    async fn stale_token_is_rejected() {
        let key = rcgen::KeyPair::generate().expect("key generation should succeed");
        let der = kops_pki::parse_pem(&key.serialize_pem()).expect("PEM should parse");
        let signer = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &der)
            .expect("key should load");

        let data = serde_json::to_vec(&AuthTokenData {
            timestamp: chrono::Utc::now().timestamp() - 3600,
            audience: kops_common::AUDIENCE_NODE_AUTHENTICATION.to_string(),
            request_hash: crate::request_hash(b""),
            key_id: "node-a".to_string(),
            instance: String::new(),
        })
        .expect("encoding should succeed");
        let signature = signer
            .sign(&SystemRandom::new(), &data)
            .expect("signing should succeed");
        let token = serde_json::to_vec(&AuthToken {
            data,
            signature: signature.as_ref().to_vec(),
        })
        .expect("encoding should succeed");
        let token = format!("{}{}", scheme::PKI, STANDARD.encode(token));

        let verifier = PkiVerifier::new(enrolled(&key), DEFAULT_MAX_TIME_SKEW);
        let err = verifier
            .verify_token(&peer(), &token, b"")
            .await
            .expect_err("stale token should fail");
        assert!(matches!(err, VerifyError::StaleTimestamp { .. }));
    }

    #[tokio::test]
    async fn garbage_after_prefix_is_bad_signature() {
        let verifier = PkiVerifier::new(Arc::new(MockHostKeyStore::new()), DEFAULT_MAX_TIME_SKEW);
        let err = verifier
            .verify_token(&peer(), "x-pki-tpm !!!", b"")
            .await
            .expect_err("garbage should fail");
        assert!(matches!(err, VerifyError::BadSignature(_)));
    }
}
