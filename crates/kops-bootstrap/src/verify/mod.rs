//! Controller-side token verification
//!
//! A [`VerifierChain`] holds one verifier per enabled scheme and returns the first
//! success. A verifier that does not recognize the token's prefix answers
//! [`VerifyError::WrongScheme`] and the chain moves on; any other error stops the
//! chain.

mod digitalocean;
mod hetzner;
mod pki;

pub use digitalocean::DigitalOceanVerifier;
pub use hetzner::HetznerVerifier;
pub use pki::{HostKey, HostKeyStore, KubeHostKeyStore, PkiVerifier};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::error::VerifyError;
use crate::model::{AuthTokenData, VerifyResult};
use crate::request_hash;

/// Default bound on |now - token timestamp|
pub const DEFAULT_MAX_TIME_SKEW: Duration = Duration::from_secs(300);

/// Connection facts a verifier may need beyond the token
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Peer address of the HTTP/gRPC connection
    pub remote_addr: Option<SocketAddr>,
}

/// Verifies a bearer token against a cloud's source of truth
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Verify `token` for a request carrying `body`
    async fn verify_token(
        &self,
        ctx: &RequestContext,
        token: &str,
        body: &[u8],
    ) -> Result<VerifyResult, VerifyError>;
}

/// Ordered list of verifiers; the first one that recognizes the token decides
#[derive(Default, Clone)]
pub struct VerifierChain {
    verifiers: Vec<Arc<dyn Verifier>>,
}

impl VerifierChain {
    /// Chain over `verifiers`, tried in order
    pub fn new(verifiers: Vec<Arc<dyn Verifier>>) -> Self {
        Self { verifiers }
    }

    /// Number of verifiers in the chain
    pub fn len(&self) -> usize {
        self.verifiers.len()
    }

    /// Returns true if the chain has no verifiers
    pub fn is_empty(&self) -> bool {
        self.verifiers.is_empty()
    }
}

#[async_trait]
impl Verifier for VerifierChain {
    async fn verify_token(
        &self,
        ctx: &RequestContext,
        token: &str,
        body: &[u8],
    ) -> Result<VerifyResult, VerifyError> {
        for verifier in &self.verifiers {
            match verifier.verify_token(ctx, token, body).await {
                Err(e) if e.is_wrong_scheme() => continue,
                other => return other,
            }
        }
        debug!("no verifier recognized the token");
        Err(VerifyError::WrongScheme)
    }
}

/// Check the claims every signed token carries: body hash, freshness, audience
pub fn check_token_claims(
    data: &AuthTokenData,
    body: &[u8],
    max_skew: Duration,
    now: i64,
) -> Result<(), VerifyError> {
    let expected = request_hash(body);
    if aws_lc_rs::constant_time::verify_slices_are_equal(&data.request_hash, &expected).is_err() {
        return Err(VerifyError::BadSignature(
            "request hash does not match body".to_string(),
        ));
    }

    let max_secs = i64::try_from(max_skew.as_secs()).unwrap_or(i64::MAX);
    let skew_secs = (now - data.timestamp).abs();
    if skew_secs > max_secs {
        return Err(VerifyError::StaleTimestamp {
            skew_secs,
            max_secs,
        });
    }

    if data.audience != kops_common::AUDIENCE_NODE_AUTHENTICATION {
        return Err(VerifyError::BadSignature(format!(
            "incorrect audience {:?}",
            data.audience
        )));
    }

    Ok(())
}

/// `host:port` of the challenge listener on `ip`
pub(crate) fn challenge_endpoint(ip: &str) -> String {
    match ip.parse::<std::net::IpAddr>() {
        Ok(addr) => SocketAddr::new(addr, kops_common::NODEUP_CHALLENGE_PORT).to_string(),
        Err(_) => format!("{}:{}", ip, kops_common::NODEUP_CHALLENGE_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str) -> VerifyResult {
        VerifyResult {
            node_name: name.to_string(),
            ..Default::default()
        }
    }

    fn claims(body: &[u8], timestamp: i64, audience: &str) -> AuthTokenData {
        AuthTokenData {
            timestamp,
            audience: audience.to_string(),
            request_hash: request_hash(body),
            key_id: "k".to_string(),
            instance: String::new(),
        }
    }

    #[tokio::test]
    async fn chain_skips_wrong_scheme() {
        let mut first = MockVerifier::new();
        first
            .expect_verify_token()
            .times(1)
            .returning(|_, _, _| Err(VerifyError::WrongScheme));
        let mut second = MockVerifier::new();
        second
            .expect_verify_token()
            .times(1)
            .returning(|_, _, _| Ok(result("node-a")));

        let chain = VerifierChain::new(vec![Arc::new(first), Arc::new(second)]);
        let verified = chain
            .verify_token(&RequestContext::default(), "x-hetzner-id 1", b"{}")
            .await
            .expect("second verifier should succeed");
        assert_eq!(verified.node_name, "node-a");
    }

    #[tokio::test]
    async fn chain_stops_at_first_recognizing_verifier() {
        let mut first = MockVerifier::new();
        first
            .expect_verify_token()
            .times(1)
            .returning(|_, _, _| Err(VerifyError::UnknownInstance("1".into())));
        let mut second = MockVerifier::new();
        second.expect_verify_token().times(0);

        let chain = VerifierChain::new(vec![Arc::new(first), Arc::new(second)]);
        let err = chain
            .verify_token(&RequestContext::default(), "x-hetzner-id 1", b"{}")
            .await
            .expect_err("first verifier's rejection should be final");
        assert!(matches!(err, VerifyError::UnknownInstance(_)));
    }

    #[tokio::test]
    async fn chain_of_strangers_is_wrong_scheme() {
        let verifiers: Vec<Arc<dyn Verifier>> = (0..3)
            .map(|_| {
                let mut v = MockVerifier::new();
                v.expect_verify_token()
                    .returning(|_, _, _| Err(VerifyError::WrongScheme));
                Arc::new(v) as Arc<dyn Verifier>
            })
            .collect();
        let chain = VerifierChain::new(verifiers);
        let err = chain
            .verify_token(&RequestContext::default(), "Bearer xyz", b"")
            .await
            .expect_err("no verifier should accept");
        assert!(err.is_wrong_scheme());
    }

    #[tokio::test]
    async fn empty_chain_rejects() {
        let chain = VerifierChain::default();
        assert!(chain.is_empty());
        assert!(chain
            .verify_token(&RequestContext::default(), "x", b"")
            .await
            .is_err());
    }

    #[test]
    fn claims_accept_fresh_matching_token() {
        let data = claims(b"body", 1_000, kops_common::AUDIENCE_NODE_AUTHENTICATION);
        check_token_claims(&data, b"body", DEFAULT_MAX_TIME_SKEW, 1_100)
            .expect("claims should be valid");
    }

    #[test]
    fn claims_reject_other_body() {
        let data = claims(b"body", 1_000, kops_common::AUDIENCE_NODE_AUTHENTICATION);
        assert!(matches!(
            check_token_claims(&data, b"tampered", DEFAULT_MAX_TIME_SKEW, 1_000),
            Err(VerifyError::BadSignature(_))
        ));
    }

    #[test]
    fn claims_reject_skew_in_either_direction() {
        let data = claims(b"b", 1_000, kops_common::AUDIENCE_NODE_AUTHENTICATION);
        for now in [1_301, 699] {
            assert!(matches!(
                check_token_claims(&data, b"b", DEFAULT_MAX_TIME_SKEW, now),
                Err(VerifyError::StaleTimestamp { skew_secs: 301, max_secs: 300 })
            ));
        }
    }

    #[test]
    fn claims_reject_other_audience() {
        let data = claims(b"b", 1_000, "kops.k8s.io/other");
        assert!(matches!(
            check_token_claims(&data, b"b", DEFAULT_MAX_TIME_SKEW, 1_000),
            Err(VerifyError::BadSignature(_))
        ));
    }

    #[test]
    fn challenge_endpoint_formats_both_families() {
        assert_eq!(challenge_endpoint("10.0.0.7"), "10.0.0.7:3989");
        assert_eq!(challenge_endpoint("fd00::7"), "[fd00::7]:3989");
    }
}
