//! `POST /bootstrap` on kops-controller
//!
//! # Flow
//!
//! 1. Read the body (400)
//! 2. Verify the `Authorization` token over the exact body bytes (403)
//! 3. Decode the request and check its API version (400)
//! 4. Run the callback challenge against the verified endpoint (403)
//! 5. Check every requested name against the allow-list and keypair IDs (400)
//! 6. Issue one certificate per name for the node's public key
//!
//! No certificate is issued unless step 4 succeeded.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use futures::FutureExt;
use kops_common::BOOTSTRAP_API_VERSION;
use kops_pki::{issue_cert, node_cert_validity, parse_rsa_public_key_pem, CertProfile, Keystore};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info, instrument, warn};

use crate::challenge::Challenger;
use crate::error::{BootstrapError, ChallengeError};
use crate::model::{BootstrapRequest, BootstrapResponse, NodeConfig, VerifyResult};
use crate::verify::{RequestContext, Verifier};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Controller-side settings of the endpoint
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Cluster this controller serves
    pub cluster_name: String,
    /// Certificate names nodes may request
    pub cert_names: BTreeSet<String>,
}

/// Source of per-instance-group node configuration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeConfigSource: Send + Sync {
    /// Configuration for nodes of `instance_group`
    async fn node_config(&self, instance_group: &str) -> Result<NodeConfig, BootstrapError>;
}

/// Role directories under `igconfig/`, as kops names instance group roles
pub const INSTANCE_GROUP_ROLES: &[&str] = &["node", "control-plane", "apiserver", "bastion"];

/// Node configuration read from the cluster's config base directory
///
/// ```text
/// <base>/cluster-completed.spec
/// <base>/igconfig/<role>/<instance-group>/nodeupconfig.yaml
/// ```
///
/// Instance group names are unique within a cluster, so the role is the one
/// directory holding configuration for the group.
pub struct FileNodeConfigSource {
    base: PathBuf,
}

impl FileNodeConfigSource {
    /// Source rooted at `base`
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    async fn read_instance_group_config(
        &self,
        instance_group: &str,
    ) -> Result<String, BootstrapError> {
        for role in INSTANCE_GROUP_ROLES {
            let path = self
                .base
                .join("igconfig")
                .join(role)
                .join(instance_group)
                .join("nodeupconfig.yaml");
            match tokio::fs::read_to_string(&path).await {
                Ok(config) => {
                    debug!(instance_group, role = %role, "loaded node configuration");
                    return Ok(config);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(BootstrapError::Internal(format!(
                        "reading {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        Err(BootstrapError::MalformedRequest(format!(
            "no node configuration for instance group {:?}",
            instance_group
        )))
    }
}

#[async_trait]
impl NodeConfigSource for FileNodeConfigSource {
    async fn node_config(&self, instance_group: &str) -> Result<NodeConfig, BootstrapError> {
        if instance_group.is_empty() || instance_group.contains(['/', '\\']) || instance_group == ".."
        {
            return Err(BootstrapError::MalformedRequest(format!(
                "invalid instance group name {:?}",
                instance_group
            )));
        }

        let instance_group_config = self.read_instance_group_config(instance_group).await?;

        let cluster_path = self.base.join("cluster-completed.spec");
        let cluster_full_config = tokio::fs::read_to_string(&cluster_path)
            .await
            .map_err(|e| {
                BootstrapError::Internal(format!("reading {}: {}", cluster_path.display(), e))
            })?;

        Ok(NodeConfig {
            instance_group_config,
            cluster_full_config,
        })
    }
}

/// Shared state of the bootstrap endpoint
pub struct BootstrapState {
    options: ServerOptions,
    keystore: Arc<Keystore>,
    verifier: Arc<dyn Verifier>,
    challenger: Arc<dyn Challenger>,
    node_configs: Option<Arc<dyn NodeConfigSource>>,
}

impl BootstrapState {
    /// Create the endpoint state
    pub fn new(
        options: ServerOptions,
        keystore: Arc<Keystore>,
        verifier: Arc<dyn Verifier>,
        challenger: Arc<dyn Challenger>,
    ) -> Self {
        Self {
            options,
            keystore,
            verifier,
            challenger,
            node_configs: None,
        }
    }

    /// Serve node configuration from `source` when requests ask for it
    pub fn with_node_configs(mut self, source: Arc<dyn NodeConfigSource>) -> Self {
        self.node_configs = Some(source);
        self
    }

    /// Map every requested name to its profile, enforcing the allow-list and the
    /// node's expected keypair IDs
    fn resolve_profiles(
        &self,
        req: &BootstrapRequest,
    ) -> Result<Vec<(CertProfile, String)>, BootstrapError> {
        let mut profiles = Vec::with_capacity(req.certs.len());
        for (name, public_key) in &req.certs {
            let profile = CertProfile::from_name(name)
                .filter(|_| self.options.cert_names.contains(name))
                .ok_or_else(|| {
                    BootstrapError::MalformedRequest(format!("key name not enabled: {}", name))
                })?;

            if !req.keypair_ids.is_empty() {
                let signer = profile.signer();
                let requested = req.keypair_ids.get(signer).map(String::as_str).unwrap_or("");
                let current = self.keystore.keypair_id(signer);
                if requested != current {
                    return Err(BootstrapError::MalformedRequest(format!(
                        "request's keypair ID {:?} for {} does not match current {:?}",
                        requested, signer, current
                    )));
                }
            }

            profiles.push((profile, public_key.clone()));
        }
        Ok(profiles)
    }

    fn issue(
        &self,
        id: &VerifyResult,
        profiles: Vec<(CertProfile, String)>,
    ) -> Result<BootstrapResponse, BootstrapError> {
        let validity = node_cert_validity(&id.node_name);
        let mut response = BootstrapResponse::default();

        for (profile, public_key_pem) in profiles {
            let public_key = parse_rsa_public_key_pem(&public_key_pem).map_err(|e| {
                BootstrapError::MalformedRequest(format!(
                    "failed to parse public key for {}: {}",
                    profile.name(),
                    e
                ))
            })?;

            let req =
                profile.request(&id.node_name, &id.certificate_names, public_key, validity);
            let cert = issue_cert(&self.keystore, &req).map_err(|e| {
                BootstrapError::Issue(format!("{}: {}", profile.name(), e))
            })?;

            response.certs.insert(profile.name().to_string(), cert);
            response.keypair_ids.insert(
                req.signer.clone(),
                self.keystore.keypair_id(&req.signer).to_string(),
            );
        }
        Ok(response)
    }
}

/// Bootstrap handler
#[instrument(skip_all)]
async fn bootstrap_handler(
    State(state): State<Arc<BootstrapState>>,
    request: Request,
) -> Result<Json<BootstrapResponse>, BootstrapError> {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let (parts, body) = request.into_parts();
    let token = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| BootstrapError::ReadBody(e.to_string()))?;

    let ctx = RequestContext { remote_addr };
    let id = state
        .verifier
        .verify_token(&ctx, &token, &body)
        .await
        .map_err(|e| {
            warn!(peer = ?remote_addr, error = %e, "bootstrap failed to verify token");
            e
        })?;

    let req: BootstrapRequest = serde_json::from_slice(&body).map_err(|e| {
        BootstrapError::MalformedRequest(format!("failed to parse request: {}", e))
    })?;
    if req.api_version != BOOTSTRAP_API_VERSION {
        return Err(BootstrapError::MalformedRequest(format!(
            "unrecognized apiVersion {:?}",
            req.api_version
        )));
    }

    let offer = req.challenge.as_ref().ok_or(ChallengeError::Missing)?;
    state
        .challenger
        .do_callback_challenge(&id.challenge_endpoint, offer)
        .await
        .map_err(|e| {
            warn!(node = %id.node_name, endpoint = %id.challenge_endpoint, error = %e, "callback challenge failed");
            e
        })?;

    let profiles = state.resolve_profiles(&req)?;

    let node_config = if req.include_node_config {
        let source = state.node_configs.as_ref().ok_or_else(|| {
            BootstrapError::MalformedRequest("node configuration is not served".to_string())
        })?;
        Some(source.node_config(&id.instance_group_name).await?)
    } else {
        None
    };

    let mut response = state.issue(&id, profiles)?;
    response.node_config = node_config;

    info!(
        node = %id.node_name,
        instance_group = %id.instance_group_name,
        certs = ?response.certs.keys().collect::<Vec<_>>(),
        "bootstrap succeeded"
    );
    Ok(Json(response))
}

async fn not_found(uri: Uri) -> Response {
    info!(path = %uri.path(), "unhandled request");
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "not found"})),
    )
        .into_response()
}

/// Convert a panicking handler into a 500
async fn recover_panics(request: Request<Body>, next: Next) -> Response {
    let path = request.uri().path().to_string();
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%path, panic = %message, "recovered from panic in handler");
            BootstrapError::Internal(message).into_response()
        }
    }
}

/// Create the bootstrap router
///
/// Routes:
/// - `POST /bootstrap` - verify, challenge, and issue certificates
///
/// Every other path answers 404.
pub fn bootstrap_router(state: Arc<BootstrapState>) -> axum::Router {
    axum::Router::new()
        .route("/bootstrap", post(bootstrap_handler))
        .fallback(not_found)
        .layer(middleware::from_fn(recover_panics))
        .with_state(state)
}

/// Keypair IDs of the CAs that sign any of `cert_names`
pub fn signer_keypair_ids(
    keystore: &Keystore,
    cert_names: &BTreeSet<String>,
) -> BTreeMap<String, String> {
    cert_names
        .iter()
        .filter_map(|n| CertProfile::from_name(n))
        .map(|p| {
            (
                p.signer().to_string(),
                keystore.keypair_id(p.signer()).to_string(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::MockChallenger;
    use crate::model::ChallengeOffer;
    use crate::test_support::{fake_hetzner_api, test_keystore};
    use crate::verify::{
        DigitalOceanVerifier, HetznerVerifier, HostKey, HostKeyStore, MockVerifier, PkiVerifier,
        VerifierChain, DEFAULT_MAX_TIME_SKEW,
    };
    use crate::VerifyError;
    use axum::http::Request as HttpRequest;
    use kops_pki::CertificateInfo;
    use tower::ServiceExt;

    const DAY: i64 = 24 * 3600;

    struct NoHosts;

    #[async_trait]
    impl HostKeyStore for NoHosts {
        async fn get(&self, _key_id: &str) -> Result<Option<HostKey>, VerifyError> {
            Ok(None)
        }
    }

    fn options() -> ServerOptions {
        ServerOptions {
            cluster_name: "c1.example.com".to_string(),
            cert_names: ["kubelet", "kubelet-server", "kube-proxy", "etcd-client-cilium"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    fn identity() -> VerifyResult {
        VerifyResult {
            node_name: "nodes-fsn1-5d4a".to_string(),
            instance_group_name: "nodes-fsn1".to_string(),
            certificate_names: vec!["10.0.0.7".to_string()],
            challenge_endpoint: "10.0.0.7:3989".to_string(),
        }
    }

    fn accepting_verifier() -> Arc<dyn Verifier> {
        let mut verifier = MockVerifier::new();
        verifier
            .expect_verify_token()
            .returning(|_, _, _| Ok(identity()));
        Arc::new(verifier)
    }

    fn passing_challenger() -> Arc<dyn Challenger> {
        let mut challenger = MockChallenger::new();
        challenger
            .expect_do_callback_challenge()
            .returning(|_, _| Ok(()));
        Arc::new(challenger)
    }

    fn state(verifier: Arc<dyn Verifier>, challenger: Arc<dyn Challenger>) -> BootstrapState {
        BootstrapState::new(
            options(),
            Arc::new(test_keystore()),
            verifier,
            challenger,
        )
    }

    fn offer() -> ChallengeOffer {
        ChallengeOffer {
            endpoint: "10.0.0.7:3989".to_string(),
            server_ca: b"-----BEGIN CERTIFICATE-----".to_vec(),
            challenge_id: "0f".repeat(16),
            challenge_secret: vec![9; 16],
        }
    }

    fn rsa_public_key() -> String {
        kops_pki::generate_rsa_key(2048)
            .expect("RSA key generation should succeed")
            .public_key_pem()
            .to_string()
    }

    fn request_body(names: &[&str]) -> BootstrapRequest {
        BootstrapRequest {
            api_version: BOOTSTRAP_API_VERSION.to_string(),
            certs: names
                .iter()
                .map(|n| (n.to_string(), rsa_public_key()))
                .collect(),
            challenge: Some(offer()),
            ..Default::default()
        }
    }

    async fn post(
        state: BootstrapState,
        token: &str,
        body: Vec<u8>,
    ) -> (StatusCode, serde_json::Value) {
        let router = bootstrap_router(Arc::new(state));
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/bootstrap")
            .header("authorization", token)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .expect("request building should succeed");

        let response = router
            .oneshot(request)
            .await
            .expect("request should succeed");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
            .await
            .expect("body reading should succeed");
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn encode(req: &BootstrapRequest) -> Vec<u8> {
        serde_json::to_vec(req).expect("serialization should succeed")
    }

    #[tokio::test]
    async fn hetzner_node_receives_kubelet_certificate() {
        let api = fake_hetzner_api().await;
        let verifier = Arc::new(VerifierChain::new(vec![Arc::new(
            HetznerVerifier::with_api_url("c1.example.com", "secret", api),
        )]));

        let mut challenger = MockChallenger::new();
        challenger
            .expect_do_callback_challenge()
            .withf(|endpoint, offer| {
                endpoint.to_string() == "10.0.0.7:3989" && offer.challenge_secret == vec![9; 16]
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let (status, json) = post(
            state(verifier, Arc::new(challenger)),
            "x-hetzner-id 12345",
            encode(&request_body(&["kubelet"])),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "body: {}", json);

        let pem = json["certs"]["kubelet"]
            .as_str()
            .expect("kubelet cert should be returned");
        let info = CertificateInfo::from_pem(pem).expect("cert should parse");
        assert_eq!(info.common_name, "system:node:nodes-fsn1-5d4a");
        assert_eq!(info.organizations, vec!["system:nodes"]);

        let now = chrono::Utc::now().timestamp();
        let days = (info.not_after - now) / DAY;
        assert!((454..=485).contains(&days), "lifetime {} days", days);
        assert_eq!(json["keypairIDs"]["kubernetes-ca"], "7001");
    }

    #[tokio::test]
    async fn bearer_token_is_rejected_by_every_verifier() {
        let chain = VerifierChain::new(vec![
            Arc::new(HetznerVerifier::with_api_url("c", "t", "http://127.0.0.1:1")),
            Arc::new(DigitalOceanVerifier::with_api_url("c", "t", "http://127.0.0.1:1")),
            Arc::new(PkiVerifier::new(Arc::new(NoHosts), DEFAULT_MAX_TIME_SKEW)),
        ]);
        let mut challenger = MockChallenger::new();
        challenger.expect_do_callback_challenge().times(0);

        let (status, _) = post(
            state(Arc::new(chain), Arc::new(challenger)),
            "Bearer xyz",
            encode(&request_body(&["kubelet"])),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn failed_challenge_issues_nothing() {
        let mut challenger = MockChallenger::new();
        challenger
            .expect_do_callback_challenge()
            .returning(|_, _| Err(ChallengeError::Mismatch));

        let (status, json) = post(
            state(accepting_verifier(), Arc::new(challenger)),
            "x-hetzner-id 12345",
            encode(&request_body(&["kubelet"])),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(json.get("certs").is_none());
    }

    #[tokio::test]
    async fn missing_challenge_is_forbidden() {
        let mut req = request_body(&["kubelet"]);
        req.challenge = None;
        let (status, _) = post(
            state(accepting_verifier(), passing_challenger()),
            "t",
            encode(&req),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn wrong_api_version_is_bad_request() {
        let mut req = request_body(&["kubelet"]);
        req.api_version = "bootstrap.kops.k8s.io/v1".to_string();
        let (status, json) = post(
            state(accepting_verifier(), passing_challenger()),
            "t",
            encode(&req),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]
            .as_str()
            .is_some_and(|m| m.contains("apiVersion")));
    }

    #[tokio::test]
    async fn undecodable_body_is_bad_request() {
        let (status, _) = post(
            state(accepting_verifier(), passing_challenger()),
            "t",
            b"{not json".to_vec(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn name_outside_allow_list_is_bad_request() {
        let (status, json) = post(
            state(accepting_verifier(), passing_challenger()),
            "t",
            encode(&request_body(&["kubelet", "machine-key"])),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "key name not enabled: machine-key");
    }

    #[tokio::test]
    async fn ecdsa_public_key_is_bad_request() {
        let mut req = request_body(&[]);
        let key = rcgen::KeyPair::generate().expect("key generation should succeed");
        req.certs
            .insert("kubelet".to_string(), key.public_key_pem());
        let (status, _) = post(
            state(accepting_verifier(), passing_challenger()),
            "t",
            encode(&req),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stale_keypair_id_is_bad_request() {
        let mut req = request_body(&["kubelet"]);
        req.keypair_ids
            .insert("kubernetes-ca".to_string(), "6999".to_string());
        let (status, json) = post(
            state(accepting_verifier(), passing_challenger()),
            "t",
            encode(&req),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]
            .as_str()
            .is_some_and(|m| m.contains("keypair ID")));
    }

    #[tokio::test]
    async fn matching_keypair_ids_are_accepted() {
        let mut req = request_body(&["kubelet", "etcd-client-cilium"]);
        req.keypair_ids = BTreeMap::from([
            ("kubernetes-ca".to_string(), "7001".to_string()),
            ("etcd-clients-ca-cilium".to_string(), "7002".to_string()),
        ]);
        let (status, json) = post(
            state(accepting_verifier(), passing_challenger()),
            "t",
            encode(&req),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "body: {}", json);

        let cilium = json["certs"]["etcd-client-cilium"]
            .as_str()
            .expect("cilium cert should be returned");
        let info = CertificateInfo::from_pem(cilium).expect("cert should parse");
        assert_eq!(info.common_name, "cilium");
        assert_eq!(json["keypairIDs"]["etcd-clients-ca-cilium"], "7002");
    }

    #[tokio::test]
    async fn kubelet_server_embeds_cloud_addresses() {
        let (status, json) = post(
            state(accepting_verifier(), passing_challenger()),
            "t",
            encode(&request_body(&["kubelet-server"])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let pem = json["certs"]["kubelet-server"]
            .as_str()
            .expect("server cert should be returned");
        let info = CertificateInfo::from_pem(pem).expect("cert should parse");
        assert_eq!(info.common_name, "nodes-fsn1-5d4a");
        assert_eq!(info.dns_names, vec!["nodes-fsn1-5d4a"]);
        assert_eq!(info.ip_addresses, vec!["10.0.0.7"]);
        assert!(info.server_auth);
    }

    #[tokio::test]
    async fn node_config_is_returned_on_request() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let ig_dir = dir.path().join("igconfig/node/nodes-fsn1");
        std::fs::create_dir_all(&ig_dir).expect("create igconfig");
        std::fs::write(ig_dir.join("nodeupconfig.yaml"), "kubeletConfig: {}\n")
            .expect("write nodeup config");
        std::fs::write(dir.path().join("cluster-completed.spec"), "spec: {}\n")
            .expect("write cluster spec");

        let state = state(accepting_verifier(), passing_challenger())
            .with_node_configs(Arc::new(FileNodeConfigSource::new(dir.path())));
        let mut req = request_body(&["kubelet"]);
        req.include_node_config = true;

        let (status, json) = post(state, "t", encode(&req)).await;
        assert_eq!(status, StatusCode::OK, "body: {}", json);
        assert_eq!(
            json["nodeConfig"]["instanceGroupConfig"],
            "kubeletConfig: {}\n"
        );
        assert_eq!(json["nodeConfig"]["clusterFullConfig"], "spec: {}\n");
    }

    #[tokio::test]
    async fn node_config_is_found_under_the_group_role() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let ig_dir = dir.path().join("igconfig/control-plane/control-plane-fsn1");
        std::fs::create_dir_all(&ig_dir).expect("create igconfig");
        std::fs::write(ig_dir.join("nodeupconfig.yaml"), "etcdManifests: []\n")
            .expect("write nodeup config");
        std::fs::write(dir.path().join("cluster-completed.spec"), "spec: {}\n")
            .expect("write cluster spec");

        let source = FileNodeConfigSource::new(dir.path());
        let config = source
            .node_config("control-plane-fsn1")
            .await
            .expect("control-plane config should load");
        assert_eq!(config.instance_group_config, "etcdManifests: []\n");

        let err = source
            .node_config("nodes-fsn1")
            .await
            .expect_err("a group without configuration should fail");
        assert!(matches!(err, BootstrapError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn missing_node_config_is_bad_request() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let state = state(accepting_verifier(), passing_challenger())
            .with_node_configs(Arc::new(FileNodeConfigSource::new(dir.path())));
        let mut req = request_body(&["kubelet"]);
        req.include_node_config = true;

        let (status, _) = post(state, "t", encode(&req)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_signer_is_internal_error() {
        let state = BootstrapState::new(
            options(),
            Arc::new(Keystore::default()),
            accepting_verifier(),
            passing_challenger(),
        );
        let (status, json) = post(state, "t", encode(&request_body(&["kubelet"]))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "internal error");
    }

    #[tokio::test]
    async fn panicking_verifier_becomes_500() {
        let mut verifier = MockVerifier::new();
        verifier
            .expect_verify_token()
            .returning(|_, _, _| panic!("verifier exploded"));

        let (status, _) = post(
            state(Arc::new(verifier), passing_challenger()),
            "t",
            encode(&request_body(&["kubelet"])),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let router = bootstrap_router(Arc::new(state(
            accepting_verifier(),
            passing_challenger(),
        )));
        let request = HttpRequest::builder()
            .method("GET")
            .uri("/healthz")
            .body(Body::empty())
            .expect("request building should succeed");
        let response = router
            .oneshot(request)
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn signer_ids_cover_enabled_names() {
        let ids = signer_keypair_ids(&test_keystore(), &options().cert_names);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids["kubernetes-ca"], "7001");
        assert_eq!(ids["etcd-clients-ca-cilium"], "7002");
    }
}
