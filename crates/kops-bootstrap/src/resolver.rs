//! Name resolution for clusters that run without DNS

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::error::ClientError;

/// Resolves the controller host name, bypassing the OS resolver
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Addresses for `host`, in the order they should be tried
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ClientError>;
}

/// Resolver over a fixed table, seeded from nodeup's configuration
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    /// Empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Add addresses for `host`
    pub fn with_host(mut self, host: impl Into<String>, addrs: Vec<IpAddr>) -> Self {
        self.hosts.entry(host.into()).or_default().extend(addrs);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ClientError> {
        match self.hosts.get(host) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs.clone()),
            _ => Err(ClientError::Transport(format!(
                "no addresses known for {}",
                host
            ))),
        }
    }
}
