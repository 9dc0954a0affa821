//! Node-side bootstrap: keys, the challenge listener, the request and its outputs

use std::collections::BTreeMap;
use std::path::Path;

use kops_bootstrap::{
    BootstrapRequest, BootstrapResponse, ChallengeListener, ClientError, KopsControllerClient,
};
use kops_common::retry::{retry_with_backoff_if, RetryConfig};
use kops_common::BOOTSTRAP_API_VERSION;
use kops_pki::{generate_rsa_key, NodeKey};
use tracing::{debug, info};

/// File the instance group's nodeup configuration is written to
pub const NODE_CONFIG_FILE: &str = "nodeupconfig.yaml";
/// File the completed cluster specification is written to
pub const CLUSTER_CONFIG_FILE: &str = "cluster-completed.spec";

/// One private key per requested certificate name
pub fn generate_keys(
    cert_names: &[String],
    key_size: usize,
) -> kops_pki::Result<BTreeMap<String, NodeKey>> {
    cert_names
        .iter()
        .map(|name| {
            debug!(cert = %name, bits = key_size, "generating private key");
            generate_rsa_key(key_size).map(|key| (name.clone(), key))
        })
        .collect()
}

/// Request body for `keys`; the challenge is filled in per attempt
pub fn build_request(
    keys: &BTreeMap<String, NodeKey>,
    include_node_config: bool,
) -> BootstrapRequest {
    BootstrapRequest {
        api_version: BOOTSTRAP_API_VERSION.to_string(),
        certs: keys
            .iter()
            .map(|(name, key)| (name.clone(), key.public_key_pem().to_string()))
            .collect(),
        include_node_config,
        ..Default::default()
    }
}

/// POST `request` until it succeeds or fails with a permanent error
///
/// Every attempt carries a fresh challenge; the listener forgets a secret once it
/// has been answered.
pub async fn request_with_retry(
    client: &KopsControllerClient,
    listener: &ChallengeListener,
    endpoint: &str,
    request: &BootstrapRequest,
    retry: &RetryConfig,
) -> Result<BootstrapResponse, ClientError> {
    retry_with_backoff_if(
        retry,
        "bootstrap",
        || async move {
            let offer = listener.create_challenge(endpoint).map_err(|e| {
                ClientError::Transport(format!("creating challenge: {}", e))
            })?;
            let mut req = request.clone();
            req.challenge = Some(offer);
            client.bootstrap(&req).await
        },
        ClientError::is_retryable,
    )
    .await
}

/// Write each issued certificate beside its key, and the node configuration if any
pub async fn write_outputs(
    dir: &Path,
    keys: &BTreeMap<String, NodeKey>,
    response: &BootstrapResponse,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    for (name, key) in keys {
        let Some(cert) = response.certs.get(name) else {
            anyhow::bail!("kops-controller did not issue a certificate for {:?}", name);
        };
        write_private(&dir.join(format!("{}.key", name)), key.private_key_pem()).await?;
        tokio::fs::write(dir.join(format!("{}.crt", name)), cert).await?;
        info!(cert = %name, "certificate written");
    }

    if let Some(config) = &response.node_config {
        tokio::fs::write(dir.join(NODE_CONFIG_FILE), &config.instance_group_config).await?;
        tokio::fs::write(dir.join(CLUSTER_CONFIG_FILE), &config.cluster_full_config).await?;
        info!(dir = %dir.display(), "node configuration written");
    }
    Ok(())
}

#[cfg(unix)]
async fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, contents).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    tokio::fs::write(path, contents).await
}
