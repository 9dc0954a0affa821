//! Cordon and drain of a single node
//!
//! Pod selection follows `kubectl drain`: mirror pods are never touched, DaemonSet
//! pods are skipped only when allowed, and pods that would lose data or have no
//! controller to recreate them need explicit permission.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use k8s_openapi::api::core::v1::Pod;
use kops_common::{Error, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClusterClient;

/// Annotation present on static (mirror) pods
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Wait between eviction attempts refused by a disruption budget
pub const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Drain behaviour
#[derive(Debug, Clone)]
pub struct DrainOptions {
    /// Delete pods that have no controller
    pub force: bool,
    /// Leave DaemonSet pods in place instead of refusing to drain
    pub ignore_all_daemon_sets: bool,
    /// Delete pods using emptyDir volumes
    pub delete_local_data: bool,
    /// Grace period passed to evictions; negative keeps each pod's own
    pub grace_period_seconds: i64,
    /// Deadline for the whole drain; zero waits forever
    pub timeout: Duration,
    /// Interval between checks that evicted pods are gone
    pub poll_interval: Duration,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            force: true,
            ignore_all_daemon_sets: true,
            delete_local_data: true,
            grace_period_seconds: -1,
            timeout: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Pods selected for deletion from one node
#[derive(Debug, Default)]
pub struct PodsForDeletion {
    /// Pods to remove, DaemonSet-managed pods last
    pub pods: Vec<Pod>,
    /// Notes about pods skipped or deleted with permission
    pub warnings: Vec<String>,
    /// Reasons the drain must not proceed
    pub errors: Vec<String>,
}

fn pod_name(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

fn controller_kind(pod: &Pod) -> Option<&str> {
    pod.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
        .map(|r| r.kind.as_str())
}

fn is_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn has_local_storage(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|vols| vols.iter().any(|v| v.empty_dir.is_some()))
}

/// Partition the pods of a node into those to evict, warnings and errors
pub fn get_pods_for_deletion(pods: Vec<Pod>, options: &DrainOptions) -> PodsForDeletion {
    let mut result = PodsForDeletion::default();

    for pod in pods {
        let name = pod_name(&pod);

        if pod
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION))
        {
            continue;
        }

        let finished = is_finished(&pod);
        let controller = controller_kind(&pod);

        if controller == Some("DaemonSet") && !finished {
            if options.ignore_all_daemon_sets {
                result
                    .warnings
                    .push(format!("ignoring DaemonSet-managed pod {}", name));
            } else {
                result
                    .errors
                    .push(format!("cannot delete DaemonSet-managed pod {}", name));
            }
            continue;
        }

        if has_local_storage(&pod) && !finished {
            if !options.delete_local_data {
                result
                    .errors
                    .push(format!("cannot delete pod with local storage {}", name));
                continue;
            }
            result
                .warnings
                .push(format!("deleting pod with local storage {}", name));
        }

        if controller.is_none() && !finished {
            if !options.force {
                result
                    .errors
                    .push(format!("cannot delete pod not managed by a controller {}", name));
                continue;
            }
            result
                .warnings
                .push(format!("deleting pod not managed by a controller {}", name));
        }

        result.pods.push(pod);
    }

    result
        .pods
        .sort_by_key(|pod| controller_kind(pod) == Some("DaemonSet"));
    result
}

fn api_code(err: &Error) -> Option<u16> {
    match err {
        Error::Kube {
            source: kube::Error::Api(ae),
        } => Some(ae.code),
        _ => None,
    }
}

/// Cordons and drains nodes
pub struct Drainer {
    client: Arc<dyn ClusterClient>,
    options: DrainOptions,
}

impl Drainer {
    /// Create a drainer
    pub fn new(client: Arc<dyn ClusterClient>, options: DrainOptions) -> Self {
        Self { client, options }
    }

    /// Mark `node` unschedulable
    pub async fn cordon(&self, node: &str) -> Result<()> {
        let patch = serde_json::json!({ "spec": { "unschedulable": true } });
        self.client.patch_node(node, &patch).await
    }

    /// Remove every eligible pod on `node` and wait for them to disappear
    ///
    /// Finished pods are deleted outright; the rest go through eviction.
    pub async fn drain(&self, node: &str, cancel: &CancellationToken) -> Result<()> {
        let deadline = (!self.options.timeout.is_zero())
            .then(|| Instant::now() + self.options.timeout);

        let pods = self.client.list_pods_on_node(node).await?;
        let selected = get_pods_for_deletion(pods, &self.options);
        if !selected.errors.is_empty() {
            return Err(Error::drain_failed(node, selected.errors.join("; ")));
        }
        for warning in &selected.warnings {
            warn!(node = %node, "{}", warning);
        }
        if selected.pods.is_empty() {
            return Ok(());
        }

        info!(node = %node, pods = selected.pods.len(), "removing pods");
        try_join_all(
            selected
                .pods
                .iter()
                .map(|pod| self.remove_and_wait(node, pod, deadline, cancel)),
        )
        .await?;
        info!(node = %node, "drained node");
        Ok(())
    }

    async fn remove_and_wait(
        &self,
        node: &str,
        pod: &Pod,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let grace = u32::try_from(self.options.grace_period_seconds).ok();

        if is_finished(pod) {
            debug!(pod = %name, "deleting finished pod");
            match self.client.delete_pod(namespace, name, grace).await {
                Ok(()) => {}
                Err(e) if api_code(&e) == Some(404) => return Ok(()),
                Err(e) => {
                    return Err(Error::drain_failed(
                        node,
                        format!("deleting {}/{}: {}", namespace, name, e),
                    ))
                }
            }
            return self.wait_for_delete(node, pod, deadline, cancel).await;
        }

        loop {
            match self.client.evict_pod(namespace, name, grace).await {
                Ok(()) => break,
                Err(e) if api_code(&e) == Some(404) => return Ok(()),
                Err(e) if api_code(&e) == Some(429) => {
                    debug!(pod = %name, "eviction refused by disruption budget, retrying");
                    self.pause(node, EVICTION_RETRY_INTERVAL, deadline, cancel).await?;
                }
                Err(e) => {
                    return Err(Error::drain_failed(
                        node,
                        format!("evicting {}/{}: {}", namespace, name, e),
                    ))
                }
            }
        }

        self.wait_for_delete(node, pod, deadline, cancel).await
    }

    /// Poll until `pod` is gone or replaced by a pod with a new UID
    async fn wait_for_delete(
        &self,
        node: &str,
        pod: &Pod,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let uid = pod.metadata.uid.as_deref();
        loop {
            match self.client.get_pod(namespace, name).await? {
                None => return Ok(()),
                Some(current) if current.metadata.uid.as_deref() != uid => return Ok(()),
                Some(_) => {
                    self.pause(node, self.options.poll_interval, deadline, cancel)
                        .await?
                }
            }
        }
    }

    /// Sleep for `interval`, failing if the deadline passes or the drain is cancelled
    async fn pause(
        &self,
        node: &str,
        interval: Duration,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if deadline.is_some_and(|d| Instant::now() + interval > d) {
            return Err(Error::drain_failed(
                node,
                format!("drain did not complete within {:?}", self.options.timeout),
            ));
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(interval) => Ok(()),
        }
    }
}
