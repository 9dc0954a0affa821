//! Rolling update settings and their per-group resolution

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

use crate::cloud::CloudProvider;
use crate::cloudinstances::InstanceGroupRole;

/// `rollingUpdate` block of a cluster or instance group spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateSpec {
    /// Members that may be unavailable at once: a count or a percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
    /// Extra members that may be launched during the rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,
}

impl RollingUpdateSpec {
    /// Field-wise merge where `group` wins over `self`
    pub fn merged_with(&self, group: Option<&RollingUpdateSpec>) -> RollingUpdateSpec {
        let group = group.cloned().unwrap_or_default();
        RollingUpdateSpec {
            max_unavailable: group.max_unavailable.or_else(|| self.max_unavailable.clone()),
            max_surge: group.max_surge.or_else(|| self.max_surge.clone()),
        }
    }
}

/// Concrete limits for one group's rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSettings {
    /// Members drained at the same time
    pub max_unavailable: usize,
    /// Members surged ahead of draining
    pub max_surge: usize,
}

/// Resolve the cluster and group settings against the group's member count
///
/// Percentages round down; a percentage `maxUnavailable` never resolves below 1.
/// Unset `maxSurge` defaults to 1 on AWS and 0 elsewhere; unset `maxUnavailable`
/// defaults to 1 when nothing surges and 0 otherwise. Control-plane groups never
/// surge.
pub fn resolve_settings(
    cluster: Option<&RollingUpdateSpec>,
    group: Option<&RollingUpdateSpec>,
    provider: CloudProvider,
    role: InstanceGroupRole,
    num_instances: usize,
) -> ResolvedSettings {
    let spec = cluster.cloned().unwrap_or_default().merged_with(group);

    let mut max_surge = match &spec.max_surge {
        Some(value) => scaled(value, num_instances),
        None if provider == CloudProvider::Aws => 1,
        None => 0,
    };

    let mut max_unavailable = match &spec.max_unavailable {
        Some(value @ IntOrString::String(_)) => scaled(value, num_instances).max(1),
        Some(value) => scaled(value, num_instances),
        None if max_surge == 0 => 1,
        None => 0,
    };

    if role == InstanceGroupRole::Master && max_surge > 0 {
        max_surge = 0;
        if max_unavailable == 0 {
            max_unavailable = 1;
        }
    }

    ResolvedSettings {
        max_unavailable,
        max_surge,
    }
}

/// Absolute value of a count or a percentage of `total`, rounded down
fn scaled(value: &IntOrString, total: usize) -> usize {
    match value {
        IntOrString::Int(n) => usize::try_from(*n).unwrap_or(0),
        IntOrString::String(s) => match s.trim().strip_suffix('%') {
            Some(percent) => total * percent.trim().parse::<usize>().unwrap_or(0) / 100,
            None => s.trim().parse::<usize>().unwrap_or(0),
        },
    }
}
