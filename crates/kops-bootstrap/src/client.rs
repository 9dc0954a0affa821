//! Node-side client of kops-controller
//!
//! Requests go to the controller URL nodeup was configured with. When a custom
//! [`Resolver`] is set the OS resolver is never consulted: each resolved address is
//! dialed in order and the first one that accepts a connection is pinned until a
//! request to it fails, after which the next request resolves the name again. Otherwise the host is resolved once up front so a
//! name that still points at the placeholder address surfaces as
//! [`ClientError::TryAgainLater`] instead of a confusing TLS failure.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use kops_common::is_placeholder_ip;
use kops_pki::ClientMtlsConfig;
use kops_proto::{DiscoverHostsRequest, DiscoverHostsResponse, KopsControllerServiceClient};
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use tokio::net::TcpStream;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::authn::Authenticator;
use crate::error::ClientError;
use crate::model::{BootstrapRequest, BootstrapResponse};
use crate::resolver::Resolver;

/// Timeout for each dial attempt against a resolved address
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Overall timeout of one HTTP request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for `/bootstrap` and `DiscoverHosts`
pub struct KopsControllerClient {
    base_url: Url,
    host: String,
    port: u16,
    ca_pem: String,
    authenticator: Arc<dyn Authenticator>,
    resolver: Option<Arc<dyn Resolver>>,
    http: Mutex<Option<reqwest::Client>>,
}

impl KopsControllerClient {
    /// Client for the controller at `base_url`, trusting the CAs in `ca_pem`
    pub fn new(
        base_url: &str,
        ca_pem: impl Into<String>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ClientError::Transport(format!("invalid URL {:?}: {}", base_url, e)))?;
        let host = base_url
            .host_str()
            .ok_or_else(|| ClientError::Transport(format!("URL {} has no host", base_url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = base_url
            .port_or_known_default()
            .ok_or_else(|| ClientError::Transport(format!("URL {} has no port", base_url)))?;

        Ok(Self {
            base_url,
            host,
            port,
            ca_pem: ca_pem.into(),
            authenticator,
            resolver: None,
            http: Mutex::new(None),
        })
    }

    /// Resolve the controller host with `resolver` instead of DNS
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Request certificates (and optionally node configuration)
    pub async fn bootstrap(
        &self,
        req: &BootstrapRequest,
    ) -> Result<BootstrapResponse, ClientError> {
        let body = serde_json::to_vec(req)
            .map_err(|e| ClientError::InvalidResponse(format!("encoding request: {}", e)))?;
        let token = self.authenticator.create_token(&body).await?;

        let http = self.http_client().await?;
        let url = self
            .base_url
            .join("/bootstrap")
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let response = match http
            .post(url)
            .header(AUTHORIZATION, token)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // Re-resolve and re-dial on the next attempt
                debug!(error = %e, "dropping pinned controller address");
                self.http.lock().take();
                return Err(ClientError::Transport(e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                detail: first_line(&text).to_string(),
            });
        }

        let parsed: BootstrapResponse = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        info!(certs = parsed.certs.len(), "bootstrap response received");
        Ok(parsed)
    }

    /// Open the host discovery stream
    ///
    /// A fresh token is created for every call.
    pub async fn discover_hosts(
        &self,
    ) -> Result<tonic::Streaming<DiscoverHostsResponse>, ClientError> {
        let tls = ClientMtlsConfig::server_only(self.ca_pem.clone(), self.host.clone())
            .to_tonic_config();

        let channel = match &self.resolver {
            Some(resolver) => {
                let addrs = resolver.resolve(&self.host).await?;
                let endpoints = addrs
                    .into_iter()
                    .map(|ip| {
                        let uri = format!("https://{}", SocketAddr::new(ip, self.port));
                        Ok(Endpoint::from_shared(uri)
                            .map_err(|e| ClientError::Transport(e.to_string()))?
                            .tls_config(tls.clone())
                            .map_err(|e| ClientError::Transport(e.to_string()))?
                            .connect_timeout(DIAL_TIMEOUT))
                    })
                    .collect::<Result<Vec<_>, ClientError>>()?;
                if endpoints.is_empty() {
                    return Err(ClientError::Transport(format!(
                        "no addresses for {}",
                        self.host
                    )));
                }
                Channel::balance_list(endpoints.into_iter())
            }
            None => {
                self.check_dns().await?;
                Endpoint::from_shared(self.base_url.to_string())
                    .map_err(|e| ClientError::Transport(e.to_string()))?
                    .tls_config(tls)
                    .map_err(|e| ClientError::Transport(e.to_string()))?
                    .connect_timeout(DIAL_TIMEOUT)
                    .connect()
                    .await
                    .map_err(|e| ClientError::Transport(e.to_string()))?
            }
        };

        let token = self.authenticator.create_token(&[]).await?;
        let token = MetadataValue::try_from(token)
            .map_err(|e| ClientError::Transport(format!("invalid token: {}", e)))?;

        let mut request = tonic::Request::new(DiscoverHostsRequest {});
        request.metadata_mut().insert("authorization", token);

        let response = KopsControllerServiceClient::new(channel)
            .discover_hosts(request)
            .await?;
        Ok(response.into_inner())
    }

    /// Cached HTTP client, built on first use
    async fn http_client(&self) -> Result<reqwest::Client, ClientError> {
        let cached = self.http.lock().clone();
        if let Some(client) = cached {
            return Ok(client);
        }

        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(DIAL_TIMEOUT);
        let roots = reqwest::Certificate::from_pem_bundle(self.ca_pem.as_bytes())
            .map_err(|e| ClientError::Transport(format!("invalid CA bundle: {}", e)))?;
        for root in roots {
            builder = builder.add_root_certificate(root);
        }

        match &self.resolver {
            Some(resolver) => {
                let addrs = resolver.resolve(&self.host).await?;
                let addr = dial_first(&addrs, self.port).await?;
                debug!(host = %self.host, %addr, "pinned controller address");
                builder = builder.resolve(&self.host, addr);
            }
            None => self.check_dns().await?,
        }

        let client = builder
            .build()
            .map_err(|e| ClientError::Transport(format!("building HTTP client: {}", e)))?;
        *self.http.lock() = Some(client.clone());
        Ok(client)
    }

    /// Resolve the host with the OS resolver and reject placeholder-only answers
    async fn check_dns(&self) -> Result<(), ClientError> {
        if self.host.parse::<IpAddr>().is_ok() {
            return Ok(());
        }
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| ClientError::Transport(format!("resolving {}: {}", self.host, e)))?
            .collect();
        check_resolved(&self.host, &addrs)
    }
}

/// Fail with `TryAgainLater` when every address is a placeholder
pub fn check_resolved(host: &str, addrs: &[SocketAddr]) -> Result<(), ClientError> {
    if addrs.is_empty() {
        return Err(ClientError::Transport(format!("{} has no addresses", host)));
    }
    if addrs.iter().all(|a| is_placeholder_ip(&a.ip())) {
        warn!(%host, "controller name still resolves to the placeholder address");
        return Err(ClientError::TryAgainLater(format!(
            "{} resolves to placeholder address",
            host
        )));
    }
    Ok(())
}

/// Dial each address in order, returning the first that accepts a connection
pub async fn dial_first(addrs: &[IpAddr], port: u16) -> Result<SocketAddr, ClientError> {
    let mut last_error = None;
    for ip in addrs {
        let addr = SocketAddr::new(*ip, port);
        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => return Ok(addr),
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "dial failed");
                last_error = Some(e.to_string());
            }
            Err(_) => {
                debug!(%addr, "dial timed out");
                last_error = Some(format!("dial {} timed out", addr));
            }
        }
    }
    Err(ClientError::Transport(last_error.unwrap_or_else(|| {
        "no addresses to dial".to_string()
    })))
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}
