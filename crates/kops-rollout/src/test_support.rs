//! Stateful fakes for rolling update tests

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ComponentStatus, Node, NodeSpec, Pod, PodSpec, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kops_common::{Error, Result, ROLLING_UPDATE_TAINT_KEY};
use parking_lot::Mutex;

use crate::client::ClusterClient;
use crate::cloud::{Cloud, CloudProvider};
use crate::cloudinstances::{
    node_map, CloudInstance, CloudInstanceGroup, CloudInstanceState, CloudInstanceStatus,
    InstanceGroup,
};
use crate::validation::{ClusterValidator, ValidationCluster, ValidationError};

/// Ordered record of mutating calls shared between fakes
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// Validation failure that belongs to no instance group
pub fn failure(message: &str) -> ValidationError {
    ValidationError {
        kind: "testing".to_string(),
        name: message.to_string(),
        message: message.to_string(),
        instance_group: None,
    }
}

struct FakeMember {
    id: String,
    status: CloudInstanceStatus,
    state: CloudInstanceState,
}

#[derive(Default)]
struct CloudState {
    groups: BTreeMap<String, (InstanceGroup, Vec<FakeMember>)>,
    deleted: Vec<String>,
    detached: Vec<String>,
    fail_delete: HashSet<String>,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Cloud whose groups live in memory
///
/// With `replace` set, every deleted instance is replaced by an up-to-date one the
/// way an auto-scaling group would.
pub struct FakeCloud {
    provider: CloudProvider,
    journal: Journal,
    replace: bool,
    state: Mutex<CloudState>,
    on_delete: Mutex<Option<Hook>>,
}

impl FakeCloud {
    pub fn new(provider: CloudProvider, journal: Journal, replace: bool) -> Self {
        Self {
            provider,
            journal,
            replace,
            state: Mutex::new(CloudState::default()),
            on_delete: Mutex::new(None),
        }
    }

    pub fn add_group(&self, group: InstanceGroup) {
        self.state
            .lock()
            .groups
            .insert(group.name.clone(), (group, Vec::new()));
    }

    fn push_member(&self, group: &str, member: FakeMember) {
        if let Some((_, members)) = self.state.lock().groups.get_mut(group) {
            members.push(member);
        }
    }

    pub fn add_member(&self, group: &str, id: &str, status: CloudInstanceStatus) {
        self.push_member(
            group,
            FakeMember {
                id: id.to_string(),
                status,
                state: CloudInstanceState::Normal,
            },
        );
    }

    pub fn add_warm_member(&self, group: &str, id: &str) {
        self.push_member(
            group,
            FakeMember {
                id: id.to_string(),
                status: CloudInstanceStatus::NeedsUpdate,
                state: CloudInstanceState::WarmPool,
            },
        );
    }

    pub fn fail_delete(&self, id: &str) {
        self.state.lock().fail_delete.insert(id.to_string());
    }

    /// Run `hook` after every successful delete
    pub fn on_delete(&self, hook: impl Fn() + Send + Sync + 'static) {
        let hook: Hook = Arc::new(hook);
        *self.on_delete.lock() = Some(hook);
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub fn detached(&self) -> Vec<String> {
        self.state.lock().detached.clone()
    }

    pub fn live_count(&self, group: &str) -> usize {
        self.state
            .lock()
            .groups
            .get(group)
            .map_or(0, |(_, members)| members.len())
    }

    pub fn instance_groups(&self) -> Vec<InstanceGroup> {
        self.state
            .lock()
            .groups
            .values()
            .map(|(ig, _)| ig.clone())
            .collect()
    }
}

#[async_trait]
impl Cloud for FakeCloud {
    fn provider(&self) -> CloudProvider {
        self.provider
    }

    async fn delete_instance(&self, instance: &CloudInstance) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.fail_delete.contains(&instance.id) {
                return Err(Error::cloud("delete instance", "injected failure"));
            }
            if let Some((_, members)) = state.groups.get_mut(&instance.group) {
                members.retain(|m| m.id != instance.id);
                if self.replace {
                    members.push(FakeMember {
                        id: format!("{}-new", instance.id),
                        status: CloudInstanceStatus::UpToDate,
                        state: CloudInstanceState::Normal,
                    });
                }
            }
            state.deleted.push(instance.id.clone());
        }
        self.journal.record(format!("delete-instance {}", instance.id));

        let hook = self.on_delete.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    async fn detach_instance(&self, instance: &CloudInstance) -> Result<()> {
        let mut state = self.state.lock();
        if let Some((_, members)) = state.groups.get_mut(&instance.group) {
            if let Some(member) = members.iter_mut().find(|m| m.id == instance.id) {
                member.status = CloudInstanceStatus::Detached;
            }
        }
        state.detached.push(instance.id.clone());
        Ok(())
    }

    fn supports_detach(&self) -> bool {
        true
    }

    async fn get_cloud_groups(
        &self,
        groups: &[InstanceGroup],
        nodes: &[Node],
    ) -> Result<BTreeMap<String, CloudInstanceGroup>> {
        let by_id = node_map(nodes, self.provider.provider_id_delimiter());
        let state = self.state.lock();
        let mut result = BTreeMap::new();
        for ig in groups {
            let Some((_, members)) = state.groups.get(&ig.name) else {
                continue;
            };
            let mut group = CloudInstanceGroup::new(format!("{}.fake", ig.name), ig.clone());
            for member in members {
                let instance = group.new_cloud_instance(member.id.clone(), member.status, &by_id)?;
                instance.state = member.state;
            }
            result.insert(ig.name.clone(), group);
        }
        Ok(result)
    }
}

/// Kubernetes API holding only nodes
pub struct FakeKube {
    journal: Journal,
    nodes: Mutex<Vec<Node>>,
    unevictable: Mutex<HashSet<String>>,
}

impl FakeKube {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            nodes: Mutex::new(Vec::new()),
            unevictable: Mutex::new(HashSet::new()),
        }
    }

    fn insert(&self, name: &str, spec: NodeSpec) {
        self.nodes.lock().push(Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(format!("fake:///{}", name)),
                ..spec
            }),
            ..Default::default()
        });
    }

    /// Node registered by the instance with the same ID
    pub fn add_node(&self, name: &str) {
        self.insert(name, NodeSpec::default());
    }

    pub fn add_tainted_node(&self, name: &str) {
        self.insert(
            name,
            NodeSpec {
                taints: Some(vec![Taint {
                    key: ROLLING_UPDATE_TAINT_KEY.to_string(),
                    effect: "PreferNoSchedule".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
        );
    }

    pub fn add_cordoned_node(&self, name: &str) {
        self.insert(
            name,
            NodeSpec {
                unschedulable: Some(true),
                ..Default::default()
            },
        );
    }

    /// Schedule a pod on `node` whose eviction always fails
    pub fn add_unevictable_pod(&self, node: &str) {
        self.unevictable.lock().insert(node.to_string());
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.lock().clone()
    }
}

#[async_trait]
impl ClusterClient for FakeKube {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes())
    }

    async fn list_component_statuses(&self) -> Result<Vec<ComponentStatus>> {
        Ok(Vec::new())
    }

    async fn list_pods_page(
        &self,
        _continue_token: Option<String>,
    ) -> Result<(Vec<Pod>, Option<String>)> {
        Ok((Vec::new(), None))
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        if !self.unevictable.lock().contains(node) {
            return Ok(Vec::new());
        }
        Ok(vec![Pod {
            metadata: ObjectMeta {
                name: Some("stuck".to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    kind: "ReplicaSet".to_string(),
                    name: "stuck".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }])
    }

    async fn get_pod(&self, _namespace: &str, _name: &str) -> Result<Option<Pod>> {
        Ok(None)
    }

    async fn patch_node(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        let spec = &patch["spec"];
        if spec["unschedulable"] == serde_json::Value::Bool(true) {
            self.journal.record(format!("cordon {}", name));
        } else if spec["taints"].is_array() {
            self.journal.record(format!("taint {}", name));
        }
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.journal.record(format!("delete-node {}", name));
        self.nodes
            .lock()
            .retain(|n| n.metadata.name.as_deref() != Some(name));
        Ok(())
    }

    async fn evict_pod(
        &self,
        _namespace: &str,
        _name: &str,
        _grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        Err(Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "eviction failed".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        })))
    }

    async fn delete_pod(
        &self,
        _namespace: &str,
        _name: &str,
        _grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Validator returning whatever `check` computes
pub struct FnValidator {
    check: Box<dyn Fn() -> ValidationCluster + Send + Sync>,
}

impl FnValidator {
    pub fn new(check: impl Fn() -> ValidationCluster + Send + Sync + 'static) -> Self {
        Self {
            check: Box::new(check),
        }
    }
}

#[async_trait]
impl ClusterValidator for FnValidator {
    async fn validate(&self) -> Result<ValidationCluster> {
        Ok((self.check)())
    }
}
