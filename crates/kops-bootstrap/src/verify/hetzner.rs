//! Verifier for `x-hetzner-id` tokens

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{challenge_endpoint, RequestContext, Verifier};
use crate::error::VerifyError;
use crate::model::VerifyResult;
use crate::scheme;

/// Hetzner Cloud API endpoint
pub const HETZNER_API_URL: &str = "https://api.hetzner.cloud";

/// Environment variable holding the API token
pub const HCLOUD_TOKEN_ENV: &str = "HCLOUD_TOKEN";

const TAG_CLUSTER_NAME: &str = "kops.k8s.io/cluster";
const TAG_INSTANCE_GROUP: &str = "kops.k8s.io/instance-group";

/// Confirms a server ID through the Hetzner Cloud API
pub struct HetznerVerifier {
    http: reqwest::Client,
    api_url: String,
    api_token: String,
    cluster_name: String,
}

impl HetznerVerifier {
    /// Verifier for `cluster_name` against the public API
    pub fn new(cluster_name: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self::with_api_url(cluster_name, api_token, HETZNER_API_URL)
    }

    /// Verifier using the API token from `HCLOUD_TOKEN`
    pub fn from_env(cluster_name: impl Into<String>) -> Result<Self, VerifyError> {
        let token = std::env::var(HCLOUD_TOKEN_ENV)
            .map_err(|_| VerifyError::CloudApi(format!("{} is not set", HCLOUD_TOKEN_ENV)))?;
        Ok(Self::new(cluster_name, token))
    }

    /// Verifier against an API at `api_url`
    pub fn with_api_url(
        cluster_name: impl Into<String>,
        api_token: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            api_token: api_token.into(),
            cluster_name: cluster_name.into(),
        }
    }

    async fn get_server(&self, server_id: u64) -> Result<Server, VerifyError> {
        let url = format!("{}/v1/servers/{}", self.api_url, server_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| VerifyError::CloudApi(format!("getting server {}: {}", server_id, e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(VerifyError::UnknownInstance(format!(
                "server {} not found",
                server_id
            )));
        }
        if !status.is_success() {
            return Err(VerifyError::CloudApi(format!(
                "getting server {}: status {}",
                server_id, status
            )));
        }

        let body: ServerResponse = response
            .json()
            .await
            .map_err(|e| VerifyError::CloudApi(format!("decoding server {}: {}", server_id, e)))?;
        Ok(body.server)
    }
}

#[async_trait]
impl Verifier for HetznerVerifier {
    async fn verify_token(
        &self,
        _ctx: &RequestContext,
        token: &str,
        _body: &[u8],
    ) -> Result<VerifyResult, VerifyError> {
        let raw_id = token
            .strip_prefix(scheme::HETZNER)
            .ok_or(VerifyError::WrongScheme)?;
        let server_id: u64 = raw_id
            .trim()
            .parse()
            .map_err(|_| VerifyError::BadSignature(format!("invalid server ID {:?}", raw_id)))?;

        let server = self.get_server(server_id).await?;

        if server.labels.get(TAG_CLUSTER_NAME) != Some(&self.cluster_name) {
            return Err(VerifyError::UnknownInstance(format!(
                "server {} is not part of cluster {:?}",
                server_id, self.cluster_name
            )));
        }
        let instance_group = server
            .labels
            .get(TAG_INSTANCE_GROUP)
            .cloned()
            .ok_or_else(|| {
                VerifyError::UnknownInstance(format!(
                    "server {} has no instance group label",
                    server_id
                ))
            })?;

        let private_ips: Vec<String> = server.private_net.iter().map(|n| n.ip.clone()).collect();
        let first_private = private_ips.first().ok_or_else(|| {
            VerifyError::UnknownInstance(format!("server {} has no private address", server_id))
        })?;
        let endpoint = challenge_endpoint(first_private);

        let mut certificate_names = private_ips.clone();
        if let Some(ipv4) = server.public_net.ipv4.as_ref() {
            certificate_names.push(ipv4.ip.clone());
        }

        debug!(server = server_id, node = %server.name, "verified hetzner server");
        Ok(VerifyResult {
            node_name: server.name,
            instance_group_name: instance_group,
            certificate_names,
            challenge_endpoint: endpoint,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ServerResponse {
    server: Server,
}

#[derive(Debug, Deserialize)]
struct Server {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    public_net: PublicNet,
    #[serde(default)]
    private_net: Vec<PrivateNet>,
}

#[derive(Debug, Default, Deserialize)]
struct PublicNet {
    ipv4: Option<Ipv4>,
}

#[derive(Debug, Deserialize)]
struct Ipv4 {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct PrivateNet {
    ip: String,
}
