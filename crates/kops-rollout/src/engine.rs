//! Rolling update of a cluster's instance groups
//!
//! Bastion groups roll in parallel, then control-plane groups one at a time, then
//! node groups one at a time. Any error aborts the remaining phases.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use kops_common::{Error, Result, ROLLING_UPDATE_TAINT_KEY};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::client::ClusterClient;
use crate::cloud::Cloud;
use crate::cloudinstances::{
    CloudInstance, CloudInstanceGroup, CloudInstanceState, CloudInstanceStatus, InstanceGroupRole,
};
use crate::drain::{DrainOptions, Drainer};
use crate::settings::{resolve_settings, RollingUpdateSpec};
use crate::validation::{ClusterValidator, ValidationCluster};

/// Operator answer to a continue prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAnswer {
    /// Continue with the next instance
    Yes,
    /// Stop the rolling update
    No,
    /// Continue without asking again
    All,
}

impl PromptAnswer {
    /// Parse an operator reply; anything unrecognised means yes
    pub fn parse(reply: &str) -> Self {
        match reply.trim().to_ascii_lowercase().as_str() {
            "n" | "no" => PromptAnswer::No,
            "a" | "all" => PromptAnswer::All,
            _ => PromptAnswer::Yes,
        }
    }
}

/// Asks the operator whether to continue after each instance
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Show `message` and wait for an answer
    async fn prompt(&self, message: &str) -> Result<PromptAnswer>;
}

/// Prompter reading answers from standard input
pub struct StdinPrompter;

#[async_trait]
impl Prompter for StdinPrompter {
    async fn prompt(&self, message: &str) -> Result<PromptAnswer> {
        let io_error = |e: std::io::Error| Error::internal("prompt", e.to_string());
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("{} (Y)es, (N)o, (A)ll: ", message).as_bytes())
            .await
            .map_err(io_error)?;
        stdout.flush().await.map_err(io_error)?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(io_error)?;
        Ok(PromptAnswer::parse(&line))
    }
}

/// Rolling update behaviour
#[derive(Debug, Clone)]
pub struct RollingUpdateOptions {
    /// Wait after terminating a control-plane instance
    pub master_interval: Duration,
    /// Wait after terminating a node instance
    pub node_interval: Duration,
    /// Wait after terminating a bastion instance
    pub bastion_interval: Duration,
    /// Wait after draining a node before deleting it
    pub post_drain_delay: Duration,
    /// Deadline for draining one node
    pub drain_timeout: Duration,
    /// Deadline for the cluster to validate
    pub validation_timeout: Duration,
    /// Wait between failed validation attempts
    pub validate_tick_duration: Duration,
    /// Wait between successful validation attempts
    pub validate_success_duration: Duration,
    /// Consecutive successful validations required; zero skips validation
    pub validate_count: usize,
    /// Abort when tainting or draining a node fails
    pub fail_on_drain_error: bool,
    /// Abort when the cluster does not validate
    pub fail_on_validate: bool,
    /// Only touch the cloud: no validation, tainting, draining or node deletion
    pub cloud_only: bool,
    /// Replace up-to-date instances as well
    pub force: bool,
    /// Prompt after every instance
    pub interactive: bool,
    /// Cluster-wide surge and unavailability settings
    pub cluster_rolling_update: Option<RollingUpdateSpec>,
    /// Names of the groups to roll; empty rolls every group
    pub instance_groups: Vec<String>,
}

impl Default for RollingUpdateOptions {
    fn default() -> Self {
        Self {
            master_interval: Duration::from_secs(15),
            node_interval: Duration::from_secs(15),
            bastion_interval: Duration::from_secs(15),
            post_drain_delay: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(15 * 60),
            validation_timeout: Duration::from_secs(15 * 60),
            validate_tick_duration: Duration::from_secs(30),
            validate_success_duration: Duration::from_secs(10),
            validate_count: 2,
            fail_on_drain_error: true,
            fail_on_validate: true,
            cloud_only: false,
            force: false,
            interactive: false,
            cluster_rolling_update: None,
            instance_groups: Vec::new(),
        }
    }
}

/// Replaces outdated instances group by group
pub struct RollingUpdateCluster {
    cloud: Arc<dyn Cloud>,
    client: Arc<dyn ClusterClient>,
    validator: Arc<dyn ClusterValidator>,
    drainer: Drainer,
    options: RollingUpdateOptions,
    prompter: Option<Arc<dyn Prompter>>,
    interactive: AtomicBool,
    cancel: CancellationToken,
}

impl RollingUpdateCluster {
    /// Create an engine
    pub fn new(
        cloud: Arc<dyn Cloud>,
        client: Arc<dyn ClusterClient>,
        validator: Arc<dyn ClusterValidator>,
        options: RollingUpdateOptions,
    ) -> Self {
        let drainer = Drainer::new(
            client.clone(),
            DrainOptions {
                timeout: options.drain_timeout,
                ..Default::default()
            },
        );
        let interactive = AtomicBool::new(options.interactive);
        Self {
            cloud,
            client,
            validator,
            drainer,
            options,
            prompter: None,
            interactive,
            cancel: CancellationToken::new(),
        }
    }

    /// Prompter used in interactive mode; standard input if unset
    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// Token whose cancellation stops the rollout at the next suspension point
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Roll every group in `groups`
    ///
    /// Members that were terminated are removed from their group, so on error
    /// `groups` reflects what is still running.
    pub async fn rolling_update(
        &self,
        groups: &mut BTreeMap<String, CloudInstanceGroup>,
    ) -> Result<()> {
        let mut bastions = Vec::new();
        let mut masters = Vec::new();
        let mut nodes = Vec::new();
        for group in groups.values_mut() {
            if !self.is_group_selected(group.name()) {
                debug!(group = %group.name(), "instance group not selected for update");
                continue;
            }
            match group.role() {
                InstanceGroupRole::Bastion => bastions.push(group),
                InstanceGroupRole::Master => masters.push(group),
                InstanceGroupRole::Node => nodes.push(group),
            }
        }

        let results = futures::future::join_all(
            bastions
                .into_iter()
                .map(|group| self.rolling_update_group(group)),
        )
        .await;
        for result in results {
            result?;
        }

        for group in masters {
            self.rolling_update_group(group).await?;
        }
        for group in nodes {
            self.rolling_update_group(group).await?;
        }

        info!("rolling update completed for cluster");
        Ok(())
    }

    /// Whether `name` takes part in this rollout
    pub fn is_group_selected(&self, name: &str) -> bool {
        self.options.instance_groups.is_empty()
            || self.options.instance_groups.iter().any(|g| g == name)
    }

    fn interval(&self, role: InstanceGroupRole) -> Duration {
        match role {
            InstanceGroupRole::Master => self.options.master_interval,
            InstanceGroupRole::Node => self.options.node_interval,
            InstanceGroupRole::Bastion => self.options.bastion_interval,
        }
    }

    /// Roll one group
    #[instrument(skip_all, fields(group = %group.name()))]
    pub async fn rolling_update_group(&self, group: &mut CloudInstanceGroup) -> Result<()> {
        let name = group.name().to_string();
        let role = group.role();
        let is_bastion = role == InstanceGroupRole::Bastion;
        let none_ready = group.ready.is_empty();

        let mut update: Vec<CloudInstance> = group.need_update.clone();
        if self.options.force {
            update.extend(group.ready.iter().cloned());
        }
        if update.is_empty() {
            debug!("no instances need updating");
            return Ok(());
        }
        info!(instances = update.len(), role = role.as_str(), "rolling update of instance group");

        if is_bastion {
            debug!("not validating the cluster as the group is a bastion");
        } else {
            self.maybe_validate(&name, "", 1).await?;
        }

        if !self.options.cloud_only {
            self.taint_all_need_update(&name, &update).await?;
        }

        // Percentages resolve against the group as found, warm pool included
        let group_size = group.len();
        let (warm_pool, live): (Vec<_>, Vec<_>) = update
            .into_iter()
            .partition(|u| u.state == CloudInstanceState::WarmPool);
        for member in &warm_pool {
            info!(instance = %member.id, "deleting warm pool instance");
            self.cloud.delete_instance(member).await?;
            group.remove_instance(&member.id);
        }
        if live.is_empty() {
            return Ok(());
        }
        let mut update = prioritize_update(live);

        let settings = resolve_settings(
            self.options.cluster_rolling_update.as_ref(),
            group.instance_group.rolling_update.as_ref(),
            self.cloud.provider(),
            role,
            group_size,
        );
        let mut max_surge = settings.max_surge.min(update.len());
        let mut max_concurrency = max_surge + settings.max_unavailable;
        if self.interactive.load(Ordering::SeqCst) {
            max_surge = max_surge.min(1);
            max_concurrency = 1;
        }

        if max_surge > 0 && !self.options.cloud_only {
            self.surge(&name, &mut update, max_surge, none_ready, role).await?;
        }

        if max_concurrency == 0 {
            info!("rolling updates for the instance group are disabled");
            return Ok(());
        }

        let interval = self.interval(role);
        let mut running = FuturesUnordered::new();
        for (index, member) in update.iter().enumerate() {
            running.push(self.drain_terminate_and_wait(member, is_bastion, interval));

            if running.len() < max_concurrency && (!none_ready || index > 0) {
                continue;
            }

            if let Some(result) = running.next().await {
                let finished = match result {
                    Ok(id) => id,
                    Err(e) => return Err(finish_pending(running, group, e).await),
                };
                group.remove_instance(&finished);
            }

            let mut completed = Vec::new();
            let mut step = Ok(());
            if !is_bastion {
                step = while_terminating(
                    &mut running,
                    &mut completed,
                    self.maybe_validate(
                        &name,
                        " after terminating instance",
                        self.options.validate_count,
                    ),
                )
                .await;
            }
            if step.is_ok() && self.interactive.load(Ordering::SeqCst) {
                step = while_terminating(
                    &mut running,
                    &mut completed,
                    self.prompt_to_continue(member),
                )
                .await;
            }
            for result in completed {
                match result {
                    Ok(id) => group.remove_instance(&id),
                    Err(e) if step.is_ok() => step = Err(e),
                    Err(e) => warn!(error = %e, "additional error while terminating instances"),
                }
            }
            if let Err(e) = step {
                return Err(finish_pending(running, group, e).await);
            }

            // Validation fails from the start of a drain until the replacement is
            // ready, so collect every completion before starting the next drain.
            while let Some(Some(result)) = running.next().now_or_never() {
                match result {
                    Ok(id) => group.remove_instance(&id),
                    Err(e) => return Err(finish_pending(running, group, e).await),
                }
            }
        }

        while let Some(result) = running.next().await {
            match result {
                Ok(id) => group.remove_instance(&id),
                Err(e) => return Err(finish_pending(running, group, e).await),
            }
        }

        if !is_bastion {
            self.maybe_validate(&name, " after terminating instance", self.options.validate_count)
                .await?;
        }

        info!("instance group rolled");
        Ok(())
    }

    /// Detach the last `max_surge` members so the cloud launches their replacements
    async fn surge(
        &self,
        group: &str,
        update: &mut [CloudInstance],
        mut max_surge: usize,
        mut none_ready: bool,
        role: InstanceGroupRole,
    ) -> Result<()> {
        if !self.cloud.supports_detach() {
            warn!(provider = %self.cloud.provider(), "cloud cannot detach instances, not surging");
            return Ok(());
        }

        let mut skipped = 0;
        let mut num_surge = 1;
        while num_surge <= max_surge {
            let Some(index) = update.len().checked_sub(num_surge + skipped) else {
                break;
            };
            let member = &mut update[index];
            if member.status == CloudInstanceStatus::Detached {
                num_surge += 1;
                continue;
            }

            match self.cloud.detach_instance(member).await {
                Ok(()) => {
                    info!(instance = %member.display_name(), "detached instance");
                    member.status = CloudInstanceStatus::Detached;
                }
                Err(e) => {
                    warn!(instance = %member.display_name(), error = %e, "failed to detach instance, trying the next one");
                    skipped += 1;
                    if max_surge > update.len().saturating_sub(skipped) {
                        max_surge -= 1;
                    }
                    continue;
                }
            }

            if num_surge == max_surge || none_ready {
                info!(wait = ?self.interval(role), "waiting after detaching instance");
                self.sleep(self.interval(role)).await?;
                self.maybe_validate(group, " after detaching instance", self.options.validate_count)
                    .await?;
                none_ready = false;
            }
            num_surge += 1;
        }
        Ok(())
    }

    /// Taint nodes so new pods avoid them while they wait their turn
    async fn taint_all_need_update(&self, group: &str, update: &[CloudInstance]) -> Result<()> {
        let to_taint: Vec<_> = update
            .iter()
            .filter_map(|u| u.node.as_ref())
            .filter(|node| {
                let spec = node.spec.as_ref();
                !spec.and_then(|s| s.unschedulable).unwrap_or(false)
                    && !spec
                        .and_then(|s| s.taints.as_ref())
                        .is_some_and(|t| t.iter().any(|t| t.key == ROLLING_UPDATE_TAINT_KEY))
            })
            .collect();
        if to_taint.is_empty() {
            return Ok(());
        }

        info!(group = %group, nodes = to_taint.len(), "tainting nodes");
        for node in to_taint {
            let name = node.metadata.name.as_deref().unwrap_or_default();
            let mut taints: Vec<serde_json::Value> = node
                .spec
                .as_ref()
                .and_then(|s| s.taints.as_ref())
                .map(|t| t.iter().filter_map(|t| serde_json::to_value(t).ok()).collect())
                .unwrap_or_default();
            taints.push(serde_json::json!({
                "key": ROLLING_UPDATE_TAINT_KEY,
                "effect": "PreferNoSchedule",
            }));
            let patch = serde_json::json!({ "spec": { "taints": taints } });

            if let Err(e) = self.client.patch_node(name, &patch).await {
                if self.options.fail_on_drain_error {
                    return Err(Error::drain_failed(name, format!("failed to taint node: {}", e)));
                }
                warn!(node = %name, error = %e, "ignoring error tainting node");
            }
        }
        Ok(())
    }

    /// Drain, delete the node object, terminate the instance and wait out the
    /// interval; returns the instance ID
    async fn drain_terminate_and_wait(
        &self,
        member: &CloudInstance,
        is_bastion: bool,
        interval: Duration,
    ) -> Result<String> {
        let node_name = member.node_name();

        if is_bastion {
            debug!(instance = %member.id, "not draining bastion instance");
        } else if self.options.cloud_only {
            warn!("not draining cluster nodes as cloud-only is set");
        } else if let Some(node) = node_name {
            info!(node = %node, "draining node");
            if let Err(e) = self.drain_node(node).await {
                if matches!(e, Error::Cancelled) || self.options.fail_on_drain_error {
                    return Err(e);
                }
                warn!(node = %node, error = %e, "ignoring error draining node");
            }
        } else {
            warn!(instance = %member.id, "skipping drain of instance not registered in kubernetes");
        }

        if !is_bastion && !self.options.cloud_only {
            match node_name {
                Some(node) => {
                    info!(node = %node, "deleting node from kubernetes");
                    match self.client.delete_node(node).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => debug!(node = %node, "node already deleted"),
                        Err(e) => return Err(e),
                    }
                }
                None => warn!(instance = %member.id, "no kubernetes node associated, skipping node deletion"),
            }
        }

        info!(instance = %member.display_name(), "terminating instance");
        self.cloud.delete_instance(member).await?;

        debug!(wait = ?interval, "waiting after terminating instance");
        self.sleep(interval).await?;
        Ok(member.id.clone())
    }

    async fn drain_node(&self, node: &str) -> Result<()> {
        self.drainer
            .cordon(node)
            .await
            .map_err(|e| Error::drain_failed(node, format!("failed to cordon: {}", e)))?;
        self.drainer.drain(node, &self.cancel).await?;

        if !self.options.post_drain_delay.is_zero() {
            info!(wait = ?self.options.post_drain_delay, "waiting after drain");
            self.sleep(self.options.post_drain_delay).await?;
        }
        Ok(())
    }

    /// Validate unless cloud-only; failures are fatal only with `fail_on_validate`
    async fn maybe_validate(&self, group: &str, context: &str, count: usize) -> Result<()> {
        if self.options.cloud_only {
            warn!("not validating cluster as cloud-only is set");
            return Ok(());
        }
        match self.validate_cluster_with_timeout(group, context, count).await {
            Ok(()) => Ok(()),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) if self.options.fail_on_validate => Err(e),
            Err(e) => {
                warn!(error = %e, "cluster did not validate, continuing since fail-on-validate is not set");
                Ok(())
            }
        }
    }

    /// Poll the validator until `count` consecutive passes or the timeout
    async fn validate_cluster_with_timeout(
        &self,
        group: &str,
        context: &str,
        count: usize,
    ) -> Result<()> {
        if count == 0 {
            warn!("skipping cluster validation because validate count is 0");
            return Ok(());
        }

        let deadline = Instant::now() + self.options.validation_timeout;
        let mut successes = 0;
        loop {
            let last_error = match self.validator.validate().await {
                Ok(result) => {
                    let failures = result.failures_for_group(group);
                    if failures.is_empty() {
                        successes += 1;
                        if successes >= count {
                            info!("cluster validated");
                            return Ok(());
                        }
                        debug!(successes, required = count, "cluster validated, confirming");
                        self.sleep(self.options.validate_success_duration).await?;
                        continue;
                    }
                    ValidationCluster::summarize(&failures)
                }
                Err(e) => e.to_string(),
            };
            successes = 0;

            if Instant::now() + self.options.validate_tick_duration > deadline {
                return Err(Error::validation_failed(context, last_error));
            }
            info!(failures = %last_error, "cluster did not pass validation, will retry");
            self.sleep(self.options.validate_tick_duration).await?;
        }
    }

    async fn prompt_to_continue(&self, member: &CloudInstance) -> Result<()> {
        let message = format!(
            "Instance {} has been replaced. Continue with the next instance?",
            member.display_name()
        );
        let answer = match &self.prompter {
            Some(prompter) => prompter.prompt(&message).await?,
            None => StdinPrompter.prompt(&message).await?,
        };
        match answer {
            PromptAnswer::Yes => Ok(()),
            PromptAnswer::All => {
                info!("continuing without further prompts");
                self.interactive.store(false, Ordering::SeqCst);
                Ok(())
            }
            PromptAnswer::No => {
                info!("rolling update stopped by operator");
                Err(Error::Cancelled)
            }
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Previously detached members go last
fn prioritize_update(update: Vec<CloudInstance>) -> Vec<CloudInstance> {
    let (detached, attached): (Vec<_>, Vec<_>) = update
        .into_iter()
        .partition(|u| u.status == CloudInstanceStatus::Detached);
    attached.into_iter().chain(detached).collect()
}

/// Await `step` while in-flight terminations keep making progress
async fn while_terminating<F, T>(
    running: &mut FuturesUnordered<F>,
    completed: &mut Vec<Result<String>>,
    step: impl std::future::Future<Output = T>,
) -> T
where
    F: std::future::Future<Output = Result<String>>,
{
    tokio::pin!(step);
    loop {
        tokio::select! {
            output = &mut step => return output,
            Some(result) = running.next(), if !running.is_empty() => completed.push(result),
        }
    }
}

/// Let in-flight terminations finish before surfacing `err`
async fn finish_pending<F>(
    mut running: FuturesUnordered<F>,
    group: &mut CloudInstanceGroup,
    err: Error,
) -> Error
where
    F: std::future::Future<Output = Result<String>>,
{
    while let Some(result) = running.next().await {
        match result {
            Ok(id) => group.remove_instance(&id),
            Err(e) => warn!(error = %e, "additional error while finishing pending terminations"),
        }
    }
    err
}
