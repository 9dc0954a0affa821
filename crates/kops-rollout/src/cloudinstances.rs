//! In-memory mirror of cloud instance groups and their members
//!
//! A [`CloudInstanceGroup`] owns its members. Members refer back to their group by
//! name only; look-ups go through the table of groups the cloud returned.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Node;
use kops_common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::settings::RollingUpdateSpec;

/// Role of an instance group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstanceGroupRole {
    /// Control-plane instances
    Master,
    /// Worker instances
    Node,
    /// SSH jump hosts, never registered as Kubernetes nodes
    Bastion,
}

impl InstanceGroupRole {
    /// Lower-case name used in log lines and validation messages
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceGroupRole::Master => "master",
            InstanceGroupRole::Node => "node",
            InstanceGroupRole::Bastion => "bastion",
        }
    }
}

/// The parts of an instance group specification the rollout needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroup {
    /// Instance group name
    pub name: String,
    /// Role of every member
    pub role: InstanceGroupRole,
    /// Minimum number of members
    #[serde(default)]
    pub min_size: usize,
    /// Maximum number of members
    #[serde(default)]
    pub max_size: usize,
    /// Group-level override of the cluster rolling update settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateSpec>,
}

impl InstanceGroup {
    /// Group with the given name and role and no size limits
    pub fn new(name: impl Into<String>, role: InstanceGroupRole) -> Self {
        Self {
            name: name.into(),
            role,
            min_size: 0,
            max_size: 0,
            rolling_update: None,
        }
    }
}

/// Whether an instance runs the current configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudInstanceStatus {
    /// Matches the group's current launch configuration
    UpToDate,
    /// Runs an outdated configuration
    NeedsUpdate,
    /// Removed from the group's target count so a replacement launches
    Detached,
}

/// Lifecycle state reported by the cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudInstanceState {
    /// Serving instance
    Normal,
    /// Pre-provisioned, stopped instance waiting to join
    WarmPool,
}

/// One member of a cloud instance group
#[derive(Debug, Clone)]
pub struct CloudInstance {
    /// Cloud instance ID
    pub id: String,
    /// Kubernetes node registered by this instance, if any
    pub node: Option<Node>,
    /// Configuration status
    pub status: CloudInstanceStatus,
    /// Lifecycle state
    pub state: CloudInstanceState,
    /// Name of the owning group
    pub group: String,
    /// Kubernetes roles of the node
    pub roles: Vec<String>,
    /// Cloud machine type
    pub machine_type: String,
    /// Private IP address
    pub private_ip: String,
}

impl CloudInstance {
    /// Name of the bound Kubernetes node
    pub fn node_name(&self) -> Option<&str> {
        self.node.as_ref().and_then(|n| n.metadata.name.as_deref())
    }

    /// Node name when bound, else the instance ID
    pub fn display_name(&self) -> &str {
        self.node_name().unwrap_or(&self.id)
    }
}

/// A cloud auto-scaling group mirrored for one instance group
#[derive(Debug, Clone)]
pub struct CloudInstanceGroup {
    /// Cloud-side group name
    pub human_name: String,
    /// Instance group this cloud group implements
    pub instance_group: InstanceGroup,
    /// Up-to-date members
    pub ready: Vec<CloudInstance>,
    /// Members that must be replaced
    pub need_update: Vec<CloudInstance>,
    /// Cloud-side minimum size
    pub min_size: usize,
    /// Cloud-side desired size
    pub target_size: usize,
    /// Cloud-side maximum size
    pub max_size: usize,
}

impl CloudInstanceGroup {
    /// Empty group for `instance_group`
    pub fn new(human_name: impl Into<String>, instance_group: InstanceGroup) -> Self {
        let min_size = instance_group.min_size;
        let max_size = instance_group.max_size;
        Self {
            human_name: human_name.into(),
            instance_group,
            ready: Vec::new(),
            need_update: Vec::new(),
            min_size,
            target_size: min_size,
            max_size,
        }
    }

    /// Add a member, filing it under `ready` or `need_update` by status and
    /// binding the node registered for `id` in `node_by_id`
    ///
    /// Fails if `id` is already a member or the group is at `max_size`; a
    /// `max_size` of zero means the group has no upper bound.
    pub fn new_cloud_instance(
        &mut self,
        id: impl Into<String>,
        status: CloudInstanceStatus,
        node_by_id: &HashMap<String, Node>,
    ) -> Result<&mut CloudInstance> {
        let id = id.into();
        if self.members().any(|m| m.id == id) {
            return Err(Error::InvalidInput(format!(
                "instance {} is already a member of group {}",
                id,
                self.name()
            )));
        }
        if self.max_size > 0 && self.len() >= self.max_size {
            return Err(Error::InvalidInput(format!(
                "group {} already has its maximum of {} instances",
                self.name(),
                self.max_size
            )));
        }
        let node = node_by_id.get(&id).cloned();
        let roles = node.as_ref().map(node_roles).unwrap_or_default();
        let instance = CloudInstance {
            id,
            node,
            status,
            state: CloudInstanceState::Normal,
            group: self.instance_group.name.clone(),
            roles,
            machine_type: String::new(),
            private_ip: String::new(),
        };

        let list = match status {
            CloudInstanceStatus::UpToDate => &mut self.ready,
            CloudInstanceStatus::NeedsUpdate | CloudInstanceStatus::Detached => {
                &mut self.need_update
            }
        };
        list.push(instance);
        let last = list.len() - 1;
        Ok(&mut list[last])
    }

    /// Name of the instance group
    pub fn name(&self) -> &str {
        &self.instance_group.name
    }

    /// Role of the instance group
    pub fn role(&self) -> InstanceGroupRole {
        self.instance_group.role
    }

    /// Number of members, ready or not
    pub fn len(&self) -> usize {
        self.ready.len() + self.need_update.len()
    }

    /// True if the group has no members
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All members, ready first
    pub fn members(&self) -> impl Iterator<Item = &CloudInstance> {
        self.ready.iter().chain(self.need_update.iter())
    }

    /// Drop the member with `id` from whichever list holds it
    pub fn remove_instance(&mut self, id: &str) {
        self.ready.retain(|i| i.id != id);
        self.need_update.retain(|i| i.id != id);
    }
}

/// Kubernetes roles from `node-role.kubernetes.io/<role>` labels
fn node_roles(node: &Node) -> Vec<String> {
    node.metadata
        .labels
        .as_ref()
        .map(|labels| {
            labels
                .keys()
                .filter_map(|k| k.strip_prefix("node-role.kubernetes.io/"))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Index nodes by the instance ID at the end of their provider ID
///
/// Provider IDs look like `aws:///us-east-1a/i-0123` or `hcloud://12345`; the ID is
/// the last segment after `delimiter`. Nodes without a provider ID are skipped.
pub fn node_map(nodes: &[Node], delimiter: char) -> HashMap<String, Node> {
    let mut by_id = HashMap::new();
    for node in nodes {
        let Some(provider_id) = node.spec.as_ref().and_then(|s| s.provider_id.as_deref()) else {
            continue;
        };
        if let Some(id) = provider_id.rsplit(delimiter).next().filter(|id| !id.is_empty()) {
            by_id.insert(id.to_string(), node.clone());
        }
    }
    by_id
}
