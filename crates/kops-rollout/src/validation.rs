//! Cluster validation
//!
//! A validation pass never errors on an unhealthy cluster; unhealthy state is
//! reported as [`ValidationError`] entries. `Err` is reserved for failing to talk to
//! Kubernetes or the cloud.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kops_common::{is_placeholder_ip, Result};
use serde::Serialize;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use crate::client::ClusterClient;
use crate::cloud::Cloud;
use crate::cloudinstances::{CloudInstanceGroup, InstanceGroup, InstanceGroupRole};

/// Priority classes whose pods must be healthy
pub const CRITICAL_PRIORITY_CLASSES: [&str; 2] = ["system-cluster-critical", "system-node-critical"];

/// Label selecting kube-controller-manager pods
const CONTROLLER_MANAGER_LABEL: (&str, &str) = ("k8s-app", "kube-controller-manager");

const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// One reason the cluster is not healthy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    /// Kind of object that failed (`dns`, `Machine`, `Node`, `Pod`, ...)
    pub kind: String,
    /// Name of the object that failed
    pub name: String,
    /// Human readable description
    pub message: String,
    /// Instance group the failure belongs to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_group: Option<String>,
}

impl ValidationError {
    fn new(kind: &str, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.into(),
            message: message.into(),
            instance_group: None,
        }
    }

    fn in_group(mut self, group: Option<&str>) -> Self {
        self.instance_group = group.map(str::to_string);
        self
    }
}

/// A node seen during validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationNode {
    /// Node name
    pub name: String,
    /// Availability zone label
    pub zone: String,
    /// Role of the node's instance group
    pub role: String,
    /// Hostname label
    pub hostname: String,
    /// Status of the `Ready` condition
    pub status: String,
}

/// Result of one validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationCluster {
    /// Everything found wrong; empty means healthy
    pub failures: Vec<ValidationError>,
    /// Every node bound to a cloud instance
    pub nodes: Vec<ValidationNode>,
}

impl ValidationCluster {
    /// Failures that block rolling `group`: those of `group` and those belonging
    /// to no group at all
    pub fn failures_for_group(&self, group: &str) -> Vec<&ValidationError> {
        self.failures
            .iter()
            .filter(|f| f.instance_group.as_deref().is_none_or(|g| g == group))
            .collect()
    }

    /// Joined messages of `failures`
    pub fn summarize(failures: &[&ValidationError]) -> String {
        failures
            .iter()
            .map(|f| f.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validates that the cluster is healthy
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterValidator: Send + Sync {
    /// Run one validation pass
    async fn validate(&self) -> Result<ValidationCluster>;
}

/// Validator backed by the Kubernetes API and the cloud provider
pub struct KubeClusterValidator {
    cluster_name: String,
    api_host: Option<String>,
    instance_groups: Vec<InstanceGroup>,
    cloud: Arc<dyn Cloud>,
    client: Arc<dyn ClusterClient>,
}

impl KubeClusterValidator {
    /// Create a validator for `instance_groups`
    ///
    /// `api_host` is the API server host name when the cluster publishes it in
    /// real DNS; `None` for gossip clusters.
    pub fn new(
        cluster_name: impl Into<String>,
        api_host: Option<String>,
        instance_groups: Vec<InstanceGroup>,
        cloud: Arc<dyn Cloud>,
        client: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            api_host,
            instance_groups,
            cloud,
            client,
        }
    }

    /// A failure if the API host still resolves only to placeholder addresses
    async fn check_dns(&self, host: &str) -> Option<ValidationError> {
        let addrs: Vec<IpAddr> = match tokio::net::lookup_host((host, 443)).await {
            Ok(addrs) => addrs.map(|a| a.ip()).collect(),
            Err(e) => {
                return Some(ValidationError::new(
                    "dns",
                    "apiserver",
                    format!("unable to resolve Kubernetes cluster API URL dns: {}", e),
                ))
            }
        };
        if !addrs.is_empty() && addrs.iter().all(is_placeholder_ip) {
            return Some(ValidationError::new(
                "dns",
                "apiserver",
                "Validation Failed\n\nThe dns-controller Kubernetes deployment has not updated the Kubernetes cluster's API DNS entry to the correct IP address.",
            ));
        }
        None
    }

    async fn list_all_pods(&self) -> Result<Vec<Pod>> {
        let mut pods = Vec::new();
        let mut token = None;
        loop {
            let (page, next) = self.client.list_pods_page(token).await?;
            pods.extend(page);
            match next {
                Some(next) => token = Some(next),
                None => return Ok(pods),
            }
        }
    }
}

#[async_trait]
impl ClusterValidator for KubeClusterValidator {
    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    async fn validate(&self) -> Result<ValidationCluster> {
        let mut result = ValidationCluster::default();

        if let Some(host) = &self.api_host {
            if let Some(failure) = self.check_dns(host).await {
                result.failures.push(failure);
                return Ok(result);
            }
        }

        let nodes = self.client.list_nodes().await?;
        let groups = self
            .cloud
            .get_cloud_groups(&self.instance_groups, &nodes)
            .await?;

        let masters = validate_nodes(&groups, &mut result);
        let group_by_node: HashMap<&str, &str> = groups
            .values()
            .flat_map(|g| {
                g.members()
                    .filter_map(move |m| m.node_name().map(|n| (n, g.name())))
            })
            .collect();

        for component in self.client.list_component_statuses().await? {
            let unhealthy = component
                .conditions
                .iter()
                .flatten()
                .any(|c| c.status != "True");
            if unhealthy {
                let name = component.metadata.name.unwrap_or_default();
                result.failures.push(ValidationError::new(
                    "ComponentStatus",
                    name.clone(),
                    format!("component {:?} is unhealthy", name),
                ));
            }
        }

        let pods = self.list_all_pods().await?;
        for pod in &pods {
            if let Some(failure) = critical_pod_failure(pod) {
                let group = pod_node(pod).and_then(|n| group_by_node.get(n).copied());
                result.failures.push(failure.in_group(group));
            }
        }

        for (master, group) in masters {
            let has_controller_manager = pods.iter().any(|p| {
                pod_node(p) == Some(master.as_str())
                    && p.metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(CONTROLLER_MANAGER_LABEL.0))
                        .is_some_and(|v| v == CONTROLLER_MANAGER_LABEL.1)
            });
            if !has_controller_manager {
                result.failures.push(
                    ValidationError::new(
                        "Node",
                        master.clone(),
                        format!("master {:?} is missing kube-controller-manager pod", master),
                    )
                    .in_group(Some(group.as_str())),
                );
            }
        }

        debug!(failures = result.failures.len(), nodes = result.nodes.len(), "validation pass complete");
        Ok(result)
    }
}

/// Size, membership and readiness checks; returns `(node, group)` for every master
fn validate_nodes(
    groups: &BTreeMap<String, CloudInstanceGroup>,
    result: &mut ValidationCluster,
) -> Vec<(String, String)> {
    let mut masters = Vec::new();

    for group in groups.values() {
        let name = group.name();
        let role = group.role();

        if group.len() < group.min_size {
            result.failures.push(
                ValidationError::new(
                    "InstanceGroup",
                    name,
                    format!(
                        "InstanceGroup {:?} did not have enough nodes {} vs {}",
                        name,
                        group.len(),
                        group.min_size
                    ),
                )
                .in_group(Some(name)),
            );
        }

        for member in group.members() {
            let Some(node) = &member.node else {
                if role != InstanceGroupRole::Bastion {
                    result.failures.push(
                        ValidationError::new(
                            "Machine",
                            member.id.clone(),
                            format!("machine {:?} has not yet joined cluster", member.id),
                        )
                        .in_group(Some(name)),
                    );
                }
                continue;
            };

            let node_name = node.metadata.name.clone().unwrap_or_default();
            result.nodes.push(ValidationNode {
                name: node_name.clone(),
                zone: label(node, ZONE_LABEL),
                role: role.as_str().to_string(),
                hostname: label(node, HOSTNAME_LABEL),
                status: condition_status(node, "Ready").unwrap_or("Unknown").to_string(),
            });

            let ready = is_node_ready(node);
            match role {
                InstanceGroupRole::Master => {
                    if !ready {
                        result.failures.push(
                            ValidationError::new(
                                "Node",
                                node_name.clone(),
                                format!("master {:?} is not ready", node_name),
                            )
                            .in_group(Some(name)),
                        );
                    }
                    masters.push((node_name, name.to_string()));
                }
                InstanceGroupRole::Node if !ready => {
                    result.failures.push(
                        ValidationError::new(
                            "Node",
                            node_name.clone(),
                            format!("node {:?} is not ready", node_name),
                        )
                        .in_group(Some(name)),
                    );
                }
                _ => {}
            }
        }
    }

    masters
}

/// Failure for a critical pod that is not healthy
fn critical_pod_failure(pod: &Pod) -> Option<ValidationError> {
    let priority = pod.spec.as_ref()?.priority_class_name.as_deref()?;
    if !CRITICAL_PRIORITY_CLASSES.contains(&priority) {
        return None;
    }

    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let full_name = format!("{}/{}", namespace, name);
    let status = pod.status.as_ref();

    match status.and_then(|s| s.phase.as_deref()) {
        Some("Succeeded") => None,
        Some("Pending") => Some(ValidationError::new(
            "Pod",
            full_name.clone(),
            format!("{} pod {:?} is pending", priority, full_name),
        )),
        Some("Unknown") => Some(ValidationError::new(
            "Pod",
            full_name.clone(),
            format!("{} pod {:?} is unknown phase", priority, full_name),
        )),
        _ => {
            let not_ready: Vec<&str> = status
                .and_then(|s| s.container_statuses.as_ref())
                .into_iter()
                .flatten()
                .filter(|c| !c.ready)
                .map(|c| c.name.as_str())
                .collect();
            if not_ready.is_empty() {
                return None;
            }
            Some(ValidationError::new(
                "Pod",
                full_name.clone(),
                format!(
                    "{} pod {:?} is not ready ({})",
                    priority,
                    full_name,
                    not_ready.join(",")
                ),
            ))
        }
    }
}

fn pod_node(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
}

fn label(node: &Node, key: &str) -> String {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .cloned()
        .unwrap_or_default()
}

fn condition_status<'a>(node: &'a Node, type_: &str) -> Option<&'a str> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status.as_str())
}

/// Ready is `True` and the network is not reported unavailable
pub fn is_node_ready(node: &Node) -> bool {
    condition_status(node, "Ready") == Some("True")
        && condition_status(node, "NetworkUnavailable") != Some("True")
}
