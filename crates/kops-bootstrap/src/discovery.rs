//! `KopsControllerService.DiscoverHosts` on kops-controller
//!
//! The controller is the source of truth for the host records nodes write into
//! `/etc/hosts` when the cluster runs without DNS. Records come from the `hosts`
//! key of the CoreDNS ConfigMap and are streamed to each node whenever they change.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use k8s_openapi::api::core::v1::ConfigMap;
use kops_proto::{Address, DiscoverHostsRequest, DiscoverHostsResponse, HostRecord};
use kube::Api;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::verify::{RequestContext, Verifier};

/// Namespace of the ConfigMap holding host records
pub const HOSTS_CONFIGMAP_NAMESPACE: &str = "kube-system";
/// Name of the ConfigMap holding host records
pub const HOSTS_CONFIGMAP_NAME: &str = "coredns";
/// Key of the hosts file inside the ConfigMap
pub const HOSTS_CONFIGMAP_KEY: &str = "hosts";
/// How often the source is re-read for each open stream
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Source of the controller's hosts file
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostsSource: Send + Sync {
    /// Current hosts-file text; empty when nothing is published yet
    async fn hosts(&self) -> Result<String, kube::Error>;
}

/// Reads `data.hosts` of the CoreDNS ConfigMap
pub struct ConfigMapHostsSource {
    api: Api<ConfigMap>,
}

impl ConfigMapHostsSource {
    /// Source backed by `kube-system/coredns`
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::namespaced(client, HOSTS_CONFIGMAP_NAMESPACE),
        }
    }
}

#[async_trait]
impl HostsSource for ConfigMapHostsSource {
    async fn hosts(&self) -> Result<String, kube::Error> {
        let cm = self.api.get_opt(HOSTS_CONFIGMAP_NAME).await?;
        Ok(cm
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(HOSTS_CONFIGMAP_KEY))
            .unwrap_or_default())
    }
}

/// Parse hosts-file text into records sorted by name
///
/// Each line is `<address> <name> [<name>...]`. Comments, blank lines, and lines
/// whose first field is not an IP address are skipped. A name listed on several
/// lines collects all of their addresses.
pub fn parse_host_records(text: &str) -> Vec<HostRecord> {
    let mut by_name: BTreeMap<&str, BTreeSet<IpAddr>> = BTreeMap::new();

    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let Some(first) = fields.next() else {
            continue;
        };
        let Ok(addr) = first.parse::<IpAddr>() else {
            debug!(line, "skipping hosts line without a leading address");
            continue;
        };
        for name in fields {
            by_name.entry(name).or_default().insert(addr);
        }
    }

    by_name
        .into_iter()
        .map(|(name, addrs)| HostRecord {
            name: name.to_string(),
            addresses: addrs
                .into_iter()
                .map(|a| Address {
                    address: a.to_string(),
                })
                .collect(),
        })
        .collect()
}

/// gRPC implementation of `DiscoverHosts`
pub struct DiscoveryService {
    verifier: Arc<dyn Verifier>,
    source: Arc<dyn HostsSource>,
    poll_interval: Duration,
}

impl DiscoveryService {
    /// Service authenticating callers with `verifier` and streaming from `source`
    pub fn new(verifier: Arc<dyn Verifier>, source: Arc<dyn HostsSource>) -> Self {
        Self {
            verifier,
            source,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the re-read interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Peer address of a request served by tonic directly or through axum
fn remote_addr<T>(request: &Request<T>) -> Option<SocketAddr> {
    request.remote_addr().or_else(|| {
        request
            .extensions()
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|info| info.0)
    })
}

#[tonic::async_trait]
impl kops_proto::KopsControllerService for DiscoveryService {
    type DiscoverHostsStream =
        Pin<Box<dyn Stream<Item = Result<DiscoverHostsResponse, Status>> + Send + 'static>>;

    async fn discover_hosts(
        &self,
        request: Request<DiscoverHostsRequest>,
    ) -> Result<Response<Self::DiscoverHostsStream>, Status> {
        let ctx = RequestContext {
            remote_addr: remote_addr(&request),
        };
        let token = request
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        // The token covers an empty body; the RPC request carries no payload
        let id = self
            .verifier
            .verify_token(&ctx, token, &[])
            .await
            .map_err(|e| {
                warn!(peer = ?ctx.remote_addr, error = %e, "discovery failed to verify token");
                Status::permission_denied("failed to verify token")
            })?;
        info!(node = %id.node_name, "host discovery stream opened");

        let (tx, rx) = mpsc::channel(4);
        let source = self.source.clone();
        let poll_interval = self.poll_interval;
        let node = id.node_name;

        tokio::spawn(async move {
            let mut last: Option<Vec<HostRecord>> = None;
            loop {
                match source.hosts().await {
                    Ok(text) => {
                        let records = parse_host_records(&text);
                        if last.as_ref() != Some(&records) {
                            let update = DiscoverHostsResponse {
                                records: records.clone(),
                                complete: true,
                            };
                            if tx.send(Ok(update)).await.is_err() {
                                break;
                            }
                            last = Some(records);
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to read host records"),
                }

                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            debug!(%node, "host discovery stream closed");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
