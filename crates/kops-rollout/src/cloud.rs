//! Cloud provider seam used by the validator and the rolling update engine

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kops_common::Result;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::cloudinstances::{CloudInstance, CloudInstanceGroup, InstanceGroup};

/// Supported cloud providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Amazon Web Services
    Aws,
    /// Google Compute Engine
    Gce,
    /// Microsoft Azure
    Azure,
    /// OpenStack
    OpenStack,
    /// Hetzner Cloud
    Hetzner,
    /// DigitalOcean
    DigitalOcean,
    /// Scaleway
    Scaleway,
}

impl CloudProvider {
    /// Character separating the segments of a node's `spec.providerID`
    pub fn provider_id_delimiter(&self) -> char {
        match self {
            CloudProvider::OpenStack => '.',
            _ => '/',
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Gce => "gce",
            CloudProvider::Azure => "azure",
            CloudProvider::OpenStack => "openstack",
            CloudProvider::Hetzner => "hetzner",
            CloudProvider::DigitalOcean => "digitalocean",
            CloudProvider::Scaleway => "scaleway",
        };
        f.write_str(name)
    }
}

/// Operations the rollout needs from a cloud provider
///
/// Implementations must be safe to call from several tasks at once; bastion groups
/// are rolled in parallel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Cloud: Send + Sync {
    /// Provider this implementation talks to
    fn provider(&self) -> CloudProvider;

    /// Terminate the instance backing `instance`
    async fn delete_instance(&self, instance: &CloudInstance) -> Result<()>;

    /// Remove `instance` from its group's target count so a replacement launches,
    /// leaving the instance running
    async fn detach_instance(&self, instance: &CloudInstance) -> Result<()>;

    /// True if [`Cloud::detach_instance`] is implemented
    fn supports_detach(&self) -> bool {
        false
    }

    /// Bind the members of every cloud group backing `groups` to their nodes
    ///
    /// The returned map is keyed by instance group name.
    async fn get_cloud_groups(
        &self,
        groups: &[InstanceGroup],
        nodes: &[Node],
    ) -> Result<BTreeMap<String, CloudInstanceGroup>>;
}
