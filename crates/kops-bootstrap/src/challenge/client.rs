//! Controller side of the callback challenge

use std::time::Duration;

use async_trait::async_trait;
use kops_pki::{issue_with_new_key, CertType, ClientMtlsConfig, Keypair, Subject};
use kops_proto::{ChallengeClient, ChallengeRequest};
#[cfg(test)]
use mockall::automock;
use tonic::transport::Endpoint;
use tracing::debug;

use super::{
    challenge_response, controller_subject, random_bytes, CHALLENGE_ID_LEN,
    CHALLENGE_SECRET_LEN, CHALLENGE_SERVER_NAME,
};
use crate::error::ChallengeError;
use crate::model::ChallengeOffer;

const CLIENT_CERT_VALIDITY: Duration = Duration::from_secs(3600);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the callback challenge against a node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Challenger: Send + Sync {
    /// Dial `endpoint` and confirm the node holds the secret from `offer`
    async fn do_callback_challenge(
        &self,
        endpoint: &str,
        offer: &ChallengeOffer,
    ) -> Result<(), ChallengeError>;
}

/// [`Challenger`] over gRPC with a client certificate minted from the cluster CA
pub struct GrpcChallenger {
    cluster_ca: Keypair,
    subject: String,
}

impl GrpcChallenger {
    /// Challenger for `cluster_name`, signing client certificates with `cluster_ca`
    pub fn new(cluster_ca: Keypair, cluster_name: &str) -> Self {
        Self {
            cluster_ca,
            subject: controller_subject(cluster_name),
        }
    }
}

#[async_trait]
impl Challenger for GrpcChallenger {
    async fn do_callback_challenge(
        &self,
        endpoint: &str,
        offer: &ChallengeOffer,
    ) -> Result<(), ChallengeError> {
        validate_offer(offer)?;
        let server_ca = std::str::from_utf8(&offer.server_ca)
            .map_err(|_| ChallengeError::InvalidOffer("serverCA is not PEM text".into()))?;

        let (cert_pem, key_pem) = issue_with_new_key(
            &self.cluster_ca,
            CertType::Client,
            &Subject::cn(self.subject.clone()),
            &[],
            CLIENT_CERT_VALIDITY,
        )
        .map_err(|e| ChallengeError::Credentials(e.to_string()))?;

        let tls = ClientMtlsConfig::new(
            cert_pem,
            key_pem,
            server_ca.to_string(),
            CHALLENGE_SERVER_NAME.to_string(),
        );

        let call_err = |e: &dyn std::fmt::Display| ChallengeError::Call {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        };

        let channel = Endpoint::from_shared(format!("https://{}", endpoint))
            .map_err(|e| call_err(&e))?
            .tls_config(tls.to_tonic_config())
            .map_err(|e| call_err(&e))?
            .connect_timeout(DIAL_TIMEOUT)
            .timeout(CALL_TIMEOUT)
            .connect()
            .await
            .map_err(|e| call_err(&e))?;

        let random = random_bytes(CHALLENGE_SECRET_LEN)
            .map_err(|_| ChallengeError::Credentials("failed to generate nonce".into()))?;

        let response = ChallengeClient::new(channel)
            .challenge(ChallengeRequest {
                challenge_id: offer.challenge_id.clone(),
                challenge_random: random.clone(),
            })
            .await
            .map_err(|status| call_err(&status.message()))?
            .into_inner();

        let expected = challenge_response(&offer.challenge_secret, &random);
        aws_lc_rs::constant_time::verify_slices_are_equal(&response.challenge_response, &expected)
            .map_err(|_| ChallengeError::Mismatch)?;

        debug!(%endpoint, "callback challenge succeeded");
        Ok(())
    }
}

fn validate_offer(offer: &ChallengeOffer) -> Result<(), ChallengeError> {
    if offer.challenge_id.len() != CHALLENGE_ID_LEN
        || !offer.challenge_id.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(ChallengeError::InvalidOffer(format!(
            "challengeID must be {} hex characters",
            CHALLENGE_ID_LEN
        )));
    }
    if offer.challenge_secret.len() != CHALLENGE_SECRET_LEN {
        return Err(ChallengeError::InvalidOffer(format!(
            "challengeSecret must be {} bytes",
            CHALLENGE_SECRET_LEN
        )));
    }
    if offer.server_ca.is_empty() {
        return Err(ChallengeError::InvalidOffer("serverCA is empty".into()));
    }
    Ok(())
}
