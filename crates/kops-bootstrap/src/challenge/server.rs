//! Node side of the callback challenge

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kops_pki::{issue_with_new_key, CertType, Keypair, ServerMtlsConfig, Subject};
use kops_proto::{Challenge, ChallengeRequest, ChallengeResponse, ChallengeServer};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::{
    challenge_response, controller_subject, hex, random_bytes, CHALLENGE_ID_LEN,
    CHALLENGE_SECRET_LEN, CHALLENGE_SERVER_NAME,
};
use crate::error::ChallengeError;
use crate::model::ChallengeOffer;

const LISTENER_CERT_VALIDITY: Duration = Duration::from_secs(24 * 3600);

/// Challenge IDs to secrets; entries are removed on first use
type SecretMap = Arc<Mutex<HashMap<String, Zeroizing<Vec<u8>>>>>;

/// The gRPC listener nodeup runs while it bootstraps
#[derive(Clone)]
pub struct ChallengeListener {
    ca_cert_pem: String,
    server_cert_pem: String,
    server_key_pem: Zeroizing<String>,
    expected_subject: String,
    secrets: SecretMap,
}

impl ChallengeListener {
    /// Create a listener that accepts the controller of `cluster_name`
    pub fn new(cluster_name: &str) -> Result<Self, ChallengeError> {
        let ca = Keypair::generate_ca("kops-challenge-ca")
            .map_err(|e| ChallengeError::Credentials(e.to_string()))?;
        let (server_cert_pem, server_key_pem) = issue_with_new_key(
            &ca,
            CertType::Server,
            &Subject::cn(CHALLENGE_SERVER_NAME),
            &[CHALLENGE_SERVER_NAME.to_string()],
            LISTENER_CERT_VALIDITY,
        )
        .map_err(|e| ChallengeError::Credentials(e.to_string()))?;

        Ok(Self {
            ca_cert_pem: ca.cert_pem().to_string(),
            server_cert_pem,
            server_key_pem,
            expected_subject: controller_subject(cluster_name),
            secrets: Arc::default(),
        })
    }

    /// Generate and remember a fresh challenge, returning the offer to send
    pub fn create_challenge(&self, endpoint: &str) -> Result<ChallengeOffer, ChallengeError> {
        let id = random_bytes(CHALLENGE_ID_LEN / 2)
            .map_err(|_| ChallengeError::Credentials("failed to generate challenge ID".into()))?;
        let secret = random_bytes(CHALLENGE_SECRET_LEN).map_err(|_| {
            ChallengeError::Credentials("failed to generate challenge secret".into())
        })?;
        let challenge_id = hex(&id);

        self.secrets
            .lock()
            .insert(challenge_id.clone(), Zeroizing::new(secret.clone()));

        Ok(ChallengeOffer {
            endpoint: endpoint.to_string(),
            server_ca: self.ca_cert_pem.clone().into_bytes(),
            challenge_id,
            challenge_secret: secret,
        })
    }

    /// Number of challenges not yet answered
    pub fn outstanding(&self) -> usize {
        self.secrets.lock().len()
    }

    /// The gRPC service, for callers that run their own server
    pub fn service(&self) -> ChallengeServer<ChallengeHandler> {
        ChallengeServer::new(ChallengeHandler {
            expected_subject: self.expected_subject.clone(),
            secrets: self.secrets.clone(),
        })
    }

    /// TLS settings requiring a client certificate signed by `cluster_ca_pem`
    pub fn tls_config(&self, cluster_ca_pem: &str) -> ServerMtlsConfig {
        ServerMtlsConfig::new(
            self.server_cert_pem.clone(),
            self.server_key_pem.clone(),
            cluster_ca_pem.to_string(),
        )
    }

    /// Serve on `listener` until `shutdown` resolves
    pub async fn serve(
        &self,
        listener: TcpListener,
        cluster_ca_pem: &str,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), tonic::transport::Error> {
        let tls = self.tls_config(cluster_ca_pem).to_tonic_config();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "challenge listener started");
        }

        Server::builder()
            .tls_config(tls)?
            .add_service(self.service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await
    }
}

/// Answers challenges for secrets created by a [`ChallengeListener`]
pub struct ChallengeHandler {
    expected_subject: String,
    secrets: SecretMap,
}

#[tonic::async_trait]
impl Challenge for ChallengeHandler {
    async fn challenge(
        &self,
        request: Request<ChallengeRequest>,
    ) -> Result<Response<ChallengeResponse>, Status> {
        if let Err(e) = kops_pki::require_peer_common_name(&request, &self.expected_subject) {
            warn!(error = %e, "rejecting challenge from unexpected peer");
            return Err(Status::permission_denied(e.to_string()));
        }

        let req = request.into_inner();
        if req.challenge_random.len() != CHALLENGE_SECRET_LEN {
            return Err(Status::invalid_argument("challenge_random must be 16 bytes"));
        }

        let secret = self
            .secrets
            .lock()
            .remove(&req.challenge_id)
            .ok_or_else(|| Status::not_found("unknown challenge"))?;

        Ok(Response::new(ChallengeResponse {
            challenge_response: challenge_response(&secret, &req.challenge_random),
        }))
    }
}
