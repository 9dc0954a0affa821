//! Rolling update of kops instance groups
//!
//! [`RollingUpdateCluster`] replaces every instance flagged as needing an update,
//! draining its node first and validating the cluster after each replacement:
//!
//! ```text
//! taint ─▶ cordon ─▶ drain ─▶ delete node ─▶ delete instance ─▶ wait ─▶ validate
//! ```
//!
//! The cloud and Kubernetes are reached through the [`Cloud`] and
//! [`ClusterClient`] traits so providers and tests can supply their own.

pub mod client;
pub mod cloud;
pub mod cloudinstances;
pub mod drain;
pub mod engine;
pub mod settings;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{ClusterClient, KubeClusterClient};
pub use cloud::{Cloud, CloudProvider};
pub use cloudinstances::{
    node_map, CloudInstance, CloudInstanceGroup, CloudInstanceState, CloudInstanceStatus,
    InstanceGroup, InstanceGroupRole,
};
pub use drain::{get_pods_for_deletion, DrainOptions, Drainer, PodsForDeletion};
pub use engine::{
    PromptAnswer, Prompter, RollingUpdateCluster, RollingUpdateOptions, StdinPrompter,
};
pub use settings::{resolve_settings, ResolvedSettings, RollingUpdateSpec};
pub use validation::{
    is_node_ready, ClusterValidator, KubeClusterValidator, ValidationCluster, ValidationError,
    ValidationNode,
};
