//! Kubernetes access for validation, tainting and draining

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ComponentStatus, Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::Client;
use kops_common::{Result, FIELD_MANAGER};

#[cfg(test)]
use mockall::automock;

/// Page size for cluster-wide pod lists
pub const POD_PAGE_SIZE: u32 = 500;

/// Trait abstracting the Kubernetes calls made during a rollout
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List every node
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// List component statuses
    async fn list_component_statuses(&self) -> Result<Vec<ComponentStatus>>;

    /// One page of pods across all namespaces and the token for the next page
    async fn list_pods_page(
        &self,
        continue_token: Option<String>,
    ) -> Result<(Vec<Pod>, Option<String>)>;

    /// Pods scheduled onto `node`
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>>;

    /// Get a pod, `None` if it no longer exists
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Apply a strategic merge patch to a node
    async fn patch_node(&self, name: &str, patch: &serde_json::Value) -> Result<()>;

    /// Delete a node object
    async fn delete_node(&self, name: &str) -> Result<()>;

    /// Evict a pod through the eviction subresource
    ///
    /// `grace_period_seconds` of `None` keeps the pod's own grace period.
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()>;

    /// Delete a pod directly, bypassing disruption budgets
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn delete_params(grace_period_seconds: Option<u32>) -> DeleteParams {
    DeleteParams {
        grace_period_seconds,
        ..Default::default()
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_component_statuses(&self) -> Result<Vec<ComponentStatus>> {
        let api: Api<ComponentStatus> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_pods_page(
        &self,
        continue_token: Option<String>,
    ) -> Result<(Vec<Pod>, Option<String>)> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let mut params = ListParams::default().limit(POD_PAGE_SIZE);
        if let Some(token) = continue_token.as_deref() {
            params = params.continue_token(token);
        }
        let list = api.list(&params).await?;
        let next = list.metadata.continue_.filter(|t| !t.is_empty());
        Ok((list.items, next))
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node));
        Ok(api.list(&params).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_node(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch(name, &params, &Patch::Strategic(patch)).await?;
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = EvictParams {
            delete_options: Some(delete_params(grace_period_seconds)),
            ..Default::default()
        };
        api.evict(name, &params).await?;
        Ok(())
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &delete_params(grace_period_seconds)).await?;
        Ok(())
    }
}
