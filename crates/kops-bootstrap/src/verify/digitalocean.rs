//! Verifier for `x-digitalocean-droplet-id` tokens

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{challenge_endpoint, RequestContext, Verifier};
use crate::error::VerifyError;
use crate::model::VerifyResult;
use crate::scheme;

/// DigitalOcean API endpoint
pub const DIGITALOCEAN_API_URL: &str = "https://api.digitalocean.com";

/// Environment variable holding the API token
pub const DIGITALOCEAN_TOKEN_ENV: &str = "DIGITALOCEAN_ACCESS_TOKEN";

const TAG_CLUSTER_PREFIX: &str = "KubernetesCluster:";
const TAG_INSTANCE_GROUP_PREFIX: &str = "kops-instancegroup:";

/// Confirms a droplet ID through the DigitalOcean API
pub struct DigitalOceanVerifier {
    http: reqwest::Client,
    api_url: String,
    api_token: String,
    cluster_tag: String,
}

impl DigitalOceanVerifier {
    /// Verifier for `cluster_name` against the public API
    pub fn new(cluster_name: &str, api_token: impl Into<String>) -> Self {
        Self::with_api_url(cluster_name, api_token, DIGITALOCEAN_API_URL)
    }

    /// Verifier using the API token from `DIGITALOCEAN_ACCESS_TOKEN`
    pub fn from_env(cluster_name: &str) -> Result<Self, VerifyError> {
        let token = std::env::var(DIGITALOCEAN_TOKEN_ENV).map_err(|_| {
            VerifyError::CloudApi(format!("{} is not set", DIGITALOCEAN_TOKEN_ENV))
        })?;
        Ok(Self::new(cluster_name, token))
    }

    /// Verifier against an API at `api_url`
    pub fn with_api_url(
        cluster_name: &str,
        api_token: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            api_token: api_token.into(),
            // Droplet tags may not contain dots
            cluster_tag: format!("{}{}", TAG_CLUSTER_PREFIX, cluster_name.replace('.', "-")),
        }
    }

    async fn get_droplet(&self, droplet_id: u64) -> Result<Droplet, VerifyError> {
        let url = format!("{}/v2/droplets/{}", self.api_url, droplet_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| {
                VerifyError::CloudApi(format!("getting droplet {}: {}", droplet_id, e))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(VerifyError::UnknownInstance(format!(
                "droplet {} not found",
                droplet_id
            )));
        }
        if !status.is_success() {
            return Err(VerifyError::CloudApi(format!(
                "getting droplet {}: status {}",
                droplet_id, status
            )));
        }

        let body: DropletResponse = response.json().await.map_err(|e| {
            VerifyError::CloudApi(format!("decoding droplet {}: {}", droplet_id, e))
        })?;
        Ok(body.droplet)
    }
}

#[async_trait]
impl Verifier for DigitalOceanVerifier {
    async fn verify_token(
        &self,
        _ctx: &RequestContext,
        token: &str,
        _body: &[u8],
    ) -> Result<VerifyResult, VerifyError> {
        let raw_id = token
            .strip_prefix(scheme::DIGITALOCEAN)
            .ok_or(VerifyError::WrongScheme)?;
        let droplet_id: u64 = raw_id
            .trim()
            .parse()
            .map_err(|_| VerifyError::BadSignature(format!("invalid droplet ID {:?}", raw_id)))?;

        let droplet = self.get_droplet(droplet_id).await?;

        if !droplet.tags.iter().any(|t| *t == self.cluster_tag) {
            return Err(VerifyError::UnknownInstance(format!(
                "droplet {} is not tagged {:?}",
                droplet_id, self.cluster_tag
            )));
        }
        let instance_group = droplet
            .tags
            .iter()
            .find_map(|t| t.strip_prefix(TAG_INSTANCE_GROUP_PREFIX))
            .map(str::to_string)
            .ok_or_else(|| {
                VerifyError::UnknownInstance(format!(
                    "droplet {} has no instance group tag",
                    droplet_id
                ))
            })?;

        let private: Vec<String> = droplet
            .networks
            .v4
            .iter()
            .filter(|n| n.kind == "private")
            .map(|n| n.ip_address.clone())
            .collect();
        let first_private = private.first().ok_or_else(|| {
            VerifyError::UnknownInstance(format!("droplet {} has no private address", droplet_id))
        })?;
        let endpoint = challenge_endpoint(first_private);

        let mut certificate_names = private.clone();
        certificate_names.extend(
            droplet
                .networks
                .v4
                .iter()
                .chain(droplet.networks.v6.iter())
                .filter(|n| n.kind != "private")
                .map(|n| n.ip_address.clone()),
        );

        debug!(droplet = droplet_id, node = %droplet.name, "verified droplet");
        Ok(VerifyResult {
            node_name: droplet.name,
            instance_group_name: instance_group,
            certificate_names,
            challenge_endpoint: endpoint,
        })
    }
}

#[derive(Debug, Deserialize)]
struct DropletResponse {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    name: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    networks: Networks,
}

#[derive(Debug, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<Network>,
    #[serde(default)]
    v6: Vec<Network>,
}

#[derive(Debug, Deserialize)]
struct Network {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Json;

    async fn fake_api() -> String {
        let router = axum::Router::new().route(
            "/v2/droplets/{id}",
            get(|Path(id): Path<u64>| async move {
                let tags = match id {
                    3164444 => vec!["KubernetesCluster:c1-example-com", "kops-instancegroup:nodes"],
                    3164445 => vec!["KubernetesCluster:c1-example-com"],
                    _ => return Err(StatusCode::NOT_FOUND),
                };
                Ok(Json(serde_json::json!({
                    "droplet": {
                        "id": id,
                        "name": "nodes-7f3c",
                        "tags": tags,
                        "networks": {
                            "v4": [
                                {"ip_address": "104.131.186.241", "type": "public"},
                                {"ip_address": "10.128.0.5", "type": "private"}
                            ],
                            "v6": []
                        }
                    }
                })))
            }),
        );
        serve(router).await
    }

    #[tokio::test]
    async fn tagged_droplet_is_verified() {
        let verifier = DigitalOceanVerifier::with_api_url("c1.example.com", "t", fake_api().await);
        let result = verifier
            .verify_token(
                &RequestContext::default(),
                "x-digitalocean-droplet-id 3164444",
                b"",
            )
            .await
            .expect("verification should succeed");

        assert_eq!(result.node_name, "nodes-7f3c");
        assert_eq!(result.instance_group_name, "nodes");
        assert_eq!(result.certificate_names, vec!["10.128.0.5", "104.131.186.241"]);
        assert_eq!(result.challenge_endpoint, "10.128.0.5:3989");
    }

    #[tokio::test]
    async fn droplet_without_group_tag_is_rejected() {
        let verifier = DigitalOceanVerifier::with_api_url("c1.example.com", "t", fake_api().await);
        let err = verifier
            .verify_token(
                &RequestContext::default(),
                "x-digitalocean-droplet-id 3164445",
                b"",
            )
            .await
            .expect_err("untagged droplet should be rejected");
        assert!(matches!(err, VerifyError::UnknownInstance(_)));
    }

    #[tokio::test]
    async fn hetzner_token_is_wrong_scheme() {
        let verifier = DigitalOceanVerifier::with_api_url("c", "t", "http://127.0.0.1:1");
        let err = verifier
            .verify_token(&RequestContext::default(), "x-hetzner-id 12345", b"")
            .await
            .expect_err("foreign scheme should be rejected");
        assert!(err.is_wrong_scheme());
    }
}
